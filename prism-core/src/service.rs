//! Adaptation service: lifecycle, configuration and transaction factory

use crate::admin::{AdminState, Metrics};
use crate::budget::BufferBudget;
use crate::config::{AdapterConfig, HookConfig, HookDispatch};
use crate::error::AdapterError;
use crate::filter::ScopeMatcher;
use crate::hook::{build_hook, ContentHook};
use crate::host::Host;
use crate::scheduler::Scheduler;
use crate::worker::WorkerDispatch;
use crate::xaction::{Xaction, XactionContext};
use crate::Result;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const SERVICE_URI: &str = "ecap://e-cap.org/ecap/services/51390/prism";

/// Options owned by the host rather than by this service
const HOST_OPTION_PREFIX: &str = "host.";

/// Everything a configuration change replaces
struct Active {
    config: AdapterConfig,
    context: Arc<XactionContext>,
    scope: ScopeMatcher,
}

pub struct AdapterService {
    runtime: Handle,
    scheduler: Arc<Scheduler>,
    metrics: Arc<Metrics>,
    active: RwLock<Active>,
    started: AtomicBool,
}

impl AdapterService {
    pub fn new(config: AdapterConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(config.max_poll_delay());
        let metrics = Arc::new(Metrics::default());
        let active = Self::activate(&runtime, &scheduler, &metrics, config, None);
        Ok(Self {
            runtime,
            scheduler,
            metrics,
            active: RwLock::new(active),
            started: AtomicBool::new(false),
        })
    }

    fn activate(
        runtime: &Handle,
        scheduler: &Arc<Scheduler>,
        metrics: &Arc<Metrics>,
        config: AdapterConfig,
        previous: Option<&XactionContext>,
    ) -> Active {
        scheduler.set_max_poll_delay(config.max_poll_delay());

        // Queued chunks stay accounted against the budget they were taken from
        let budget = match previous {
            Some(previous) if previous.budget.memory_limit() == config.buffer_memory_limit => {
                previous.budget.clone()
            }
            _ => BufferBudget::new(config.buffer_memory_limit),
        };
        let dispatch = match previous {
            Some(previous) if previous.dispatch.max_workers() == config.max_concurrent_workers => {
                previous.dispatch.clone()
            }
            _ => WorkerDispatch::new(
                runtime.clone(),
                config.max_concurrent_workers,
                Arc::clone(scheduler),
                Arc::clone(metrics),
            ),
        };
        let hook = match previous {
            Some(previous) if previous.hook_config == config.hook => Arc::clone(&previous.hook),
            _ => build_hook(&config.hook),
        };

        let context = Arc::new(XactionContext {
            dispatch,
            hook,
            hook_config: config.hook.clone(),
            budget,
            metrics: Arc::clone(metrics),
            hook_dispatch: config.dispatch,
            content_source: config.content_source,
        });

        Active {
            scope: ScopeMatcher::new(&config.scope),
            config,
            context,
        }
    }

    /// Unique across all adapter vendors
    pub fn uri(&self) -> &'static str {
        SERVICE_URI
    }

    /// Changes with version and configuration
    pub fn tag(&self) -> String {
        let active = self.active.read();
        format!(
            "{}-{}-{}",
            env!("CARGO_PKG_VERSION"),
            active.context.hook.name(),
            match active.config.dispatch {
                HookDispatch::Inline => "inline",
                HookDispatch::Background => "background",
            }
        )
    }

    pub fn describe(&self) -> String {
        format!(
            "A modifying adapter from {} v{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )
    }

    pub fn config(&self) -> AdapterConfig {
        self.active.read().config.clone()
    }

    /// Apply name/value options on top of the current configuration.
    ///
    /// Options prefixed with `host.` belong to the host and are skipped. The
    /// whole set is rejected if any name is unknown or the result does not
    /// validate. Transactions already running keep their settings.
    pub fn configure<'a, I>(&self, options: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = self.config();
        for (name, value) in options {
            Self::set_one(&mut config, name, value)?;
        }
        config.validate()?;

        let mut active = self.active.write();
        let next = Self::activate(
            &self.runtime,
            &self.scheduler,
            &self.metrics,
            config,
            Some(active.context.as_ref()),
        );
        // A running service gets the new hook ready before it sees traffic
        if self.started.load(Ordering::Acquire)
            && !Arc::ptr_eq(&next.context.hook, &active.context.hook)
        {
            next.context.hook.init()?;
            info!("Initialized replacement {} hook", next.context.hook.name());
        }
        *active = next;
        info!("Adapter configured: {}", self.tag_of(&active));
        Ok(())
    }

    pub fn reconfigure<'a, I>(&self, options: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.configure(options)
    }

    fn tag_of(&self, active: &Active) -> String {
        format!("hook={}, dispatch={:?}", active.context.hook.name(), active.config.dispatch)
    }

    fn set_one(config: &mut AdapterConfig, name: &str, value: &str) -> Result<()> {
        if name.starts_with(HOST_OPTION_PREFIX) {
            debug!("Skipping host option {}", name);
            return Ok(());
        }

        let invalid = |e: &dyn std::fmt::Display| {
            AdapterError::Configuration(format!("invalid value for {}: {}", name, e))
        };

        match name {
            "hook" => {
                config.hook = match value.to_ascii_lowercase().as_str() {
                    "none" => HookConfig::None,
                    "dump" => HookConfig::Dump {
                        dir: match &config.hook {
                            HookConfig::Dump { dir } => dir.clone(),
                            _ => std::env::temp_dir(),
                        },
                    },
                    "analyzer" => HookConfig::Analyzer {
                        min_chunk: crate::analyzer::DEFAULT_MIN_CHUNK,
                    },
                    other => return Err(invalid(&format!("unknown hook {}", other))),
                }
            }
            "dump_dir" => {
                config.hook = HookConfig::Dump {
                    dir: PathBuf::from(value),
                }
            }
            "analyzer_min_chunk" => {
                config.hook = HookConfig::Analyzer {
                    min_chunk: value.parse().map_err(|e| invalid(&e))?,
                }
            }
            "dispatch" => config.dispatch = value.parse()?,
            "content_source" => config.content_source = value.parse()?,
            "max_poll_delay_ms" => {
                config.max_poll_delay_ms = value.parse().map_err(|e| invalid(&e))?
            }
            "buffer_memory_limit" => {
                config.buffer_memory_limit = value.parse().map_err(|e| invalid(&e))?
            }
            "max_concurrent_workers" => {
                config.max_concurrent_workers = value.parse().map_err(|e| invalid(&e))?
            }
            "scope_allow" => config.scope.allow = split_list(value),
            "scope_block" => config.scope.block = split_list(value),
            _ => {
                return Err(AdapterError::Configuration(format!(
                    "unsupported configuration parameter: {}",
                    name
                )))
            }
        }
        Ok(())
    }

    /// Prepare the hook for traffic
    pub fn start(&self) -> Result<()> {
        let hook = Arc::clone(&self.active.read().context.hook);
        info!("Prism starting with {} hook", hook.name());
        hook.init()?;
        self.started.store(true, Ordering::Release);
        info!("Prism init OK");
        Ok(())
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        info!(
            "Prism stopping, {} transactions waiting, {} units working",
            self.scheduler.waiting_count(),
            self.scheduler.working_count()
        );
    }

    pub fn retire(&self) {
        self.stop();
    }

    pub fn wants_url(&self, url: &str) -> bool {
        self.active.read().scope.wants_url(url)
    }

    /// Whether transactions may finish work off the host thread
    pub fn makes_async_xactions(&self) -> bool {
        self.active.read().config.dispatch == HookDispatch::Background
    }

    /// Create a transaction for one host message
    pub fn make_xaction(&self, host: Weak<dyn Host>) -> Arc<Xaction> {
        let context = Arc::clone(&self.active.read().context);
        Xaction::new(context, host)
    }

    /// The host is about to idle for up to `requested`; returns how long it
    /// may actually wait before calling [`Self::resume`].
    pub fn suspend(&self, requested: Duration) -> Duration {
        self.scheduler.recommend_idle_budget(requested)
    }

    /// Notify the host about every transaction whose background work ended
    pub fn resume(&self) -> usize {
        let resumed = self.scheduler.drain_waiting();
        if resumed > 0 {
            debug!("Resumed {} transactions", resumed);
        }
        resumed
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Hook used by transactions created from now on
    pub fn hook(&self) -> Arc<dyn ContentHook> {
        Arc::clone(&self.active.read().context.hook)
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            metrics: Arc::clone(&self.metrics),
            scheduler: Arc::clone(&self.scheduler),
            budget: self.active.read().context.budget.clone(),
        }
    }
}

impl Drop for AdapterService {
    fn drop(&mut self) {
        if self.scheduler.waiting_count() > 0 {
            warn!(
                "Adapter service dropped with {} transactions still waiting",
                self.scheduler.waiting_count()
            );
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
