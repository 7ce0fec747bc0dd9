//! Prism Agent
//!
//! Command-line replay host for the adaptation engine. It plays the proxy's
//! role for one message read from disk: delivers the virgin body in chunks,
//! honours the idle-budget protocol, and writes out the adapted body.

use clap::Parser;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use prism_core::admin::start_admin_server;
use prism_core::config::{ContentSource, HookConfig, HookDispatch};
use prism_core::{AdapterConfig, AdapterError, AdapterService, Message};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod replay;


pub use replay::{run_replay, ReplayHost, ReplayInput, ReplayReport};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// File holding the virgin body; without it the message has no body
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Virgin header as "Name: value" (repeatable)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Request URI the message answers
    #[arg(long, default_value = "http://localhost/")]
    pub uri: String,

    /// Where to write the adapted body (stdout if omitted)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Virgin bytes delivered per chunk
    #[arg(long, default_value_t = 4096)]
    pub chunk_size: usize,

    /// Path to adapter configuration file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Content hook: none, dump or analyzer
    #[arg(long)]
    pub hook: Option<String>,

    /// Directory for the dump hook
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,

    /// Where hook calls run: inline or background
    #[arg(long)]
    pub dispatch: Option<String>,

    /// Adapted content source: buffered or hook
    #[arg(long)]
    pub content_source: Option<String>,

    /// Longest idle time while background units work (milliseconds)
    #[arg(long)]
    pub max_poll_delay_ms: Option<u64>,

    /// Total bytes all transactions may buffer
    #[arg(long)]
    pub buffer_memory_limit: Option<usize>,

    /// Maximum number of background units at once
    #[arg(long)]
    pub max_concurrent_workers: Option<usize>,

    /// Port to expose the Admin API (health/metrics)
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Initialize logging; RUST_LOG wins over `level`
pub fn init_logging(level: &str) -> Result<(), AdapterError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            AdapterError::Configuration(format!("Invalid log level {}: {}", level, e))
        })?,
    };

    // Try to initialize logging, ignore if already initialized
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init();

    match result {
        Ok(_) => tracing::debug!("Logging initialized at {}", level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }
    Ok(())
}

/// Load adapter configuration with precedence: CLI args > env vars > config file > defaults
pub fn load_adapter_config(args: &Args) -> Result<AdapterConfig, AdapterError> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                AdapterError::Configuration(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serde_json::from_str(&text).map_err(|e| {
                AdapterError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            })?
        }
        None => AdapterConfig::default(),
    };

    // Environment variables
    let hook = env_var::<String>("PRISM_HOOK")?;
    let dump_dir = env_var::<PathBuf>("PRISM_DUMP_DIR")?;
    config.hook = select_hook(&config.hook, hook.as_deref(), dump_dir)?;
    if let Some(dispatch) = env_var::<HookDispatch>("PRISM_DISPATCH")? {
        config.dispatch = dispatch;
    }
    if let Some(source) = env_var::<ContentSource>("PRISM_CONTENT_SOURCE")? {
        config.content_source = source;
    }
    if let Some(delay) = env_var::<u64>("PRISM_MAX_POLL_DELAY_MS")? {
        config.max_poll_delay_ms = delay;
    }
    if let Some(limit) = env_var::<usize>("PRISM_BUFFER_MEMORY_LIMIT")? {
        config.buffer_memory_limit = limit;
    }
    if let Some(workers) = env_var::<usize>("PRISM_MAX_CONCURRENT_WORKERS")? {
        config.max_concurrent_workers = workers;
    }

    // CLI arguments
    config.hook = select_hook(&config.hook, args.hook.as_deref(), args.dump_dir.clone())?;
    if let Some(dispatch) = &args.dispatch {
        config.dispatch = dispatch.parse()?;
    }
    if let Some(source) = &args.content_source {
        config.content_source = source.parse()?;
    }
    if let Some(delay) = args.max_poll_delay_ms {
        config.max_poll_delay_ms = delay;
    }
    if let Some(limit) = args.buffer_memory_limit {
        config.buffer_memory_limit = limit;
    }
    if let Some(workers) = args.max_concurrent_workers {
        config.max_concurrent_workers = workers;
    }

    config.validate()?;
    Ok(config)
}

fn env_var<T>(name: &str) -> Result<Option<T>, AdapterError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value.parse().map(Some).map_err(|e| {
            AdapterError::Configuration(format!("Invalid {} value {:?}: {}", name, value, e))
        }),
        Err(_) => Ok(None),
    }
}

/// Resolve a hook choice on top of `current`
fn select_hook(
    current: &HookConfig,
    kind: Option<&str>,
    dump_dir: Option<PathBuf>,
) -> Result<HookConfig, AdapterError> {
    let kind = match kind {
        Some(kind) => kind.to_ascii_lowercase(),
        // A dump directory alone selects the dump hook
        None if dump_dir.is_some() => "dump".to_string(),
        None => return Ok(current.clone()),
    };

    match kind.as_str() {
        "none" => Ok(HookConfig::None),
        "analyzer" => Ok(match current {
            HookConfig::Analyzer { .. } => current.clone(),
            _ => HookConfig::Analyzer {
                min_chunk: prism_core::analyzer::DEFAULT_MIN_CHUNK,
            },
        }),
        "dump" => match (dump_dir, current) {
            (Some(dir), _) => Ok(HookConfig::Dump { dir }),
            (None, HookConfig::Dump { dir }) => Ok(HookConfig::Dump { dir: dir.clone() }),
            (None, _) => Err(AdapterError::Configuration(
                "dump hook requires a dump directory".to_string(),
            )),
        },
        other => Err(AdapterError::Configuration(format!("unknown hook: {}", other))),
    }
}

/// Build the virgin message envelope from "Name: value" lines
pub fn parse_headers(lines: &[String], has_body: bool) -> Result<Message, AdapterError> {
    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            AdapterError::Configuration(format!("header {:?} is not \"Name: value\"", line))
        })?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| AdapterError::Configuration(format!("bad header name in {:?}: {}", line, e)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| AdapterError::Configuration(format!("bad header value in {:?}: {}", line, e)))?;
        headers.append(name, value);
    }
    Ok(Message::new(headers, has_body))
}

pub async fn run_agent(
    args: Args,
    config: AdapterConfig,
) -> Result<ReplayReport, Box<dyn std::error::Error>> {
    tracing::info!("Starting Prism Agent...");
    tracing::info!("  URI:      {}", args.uri);
    tracing::info!("  Hook:     {:?}", config.hook);
    tracing::info!("  Dispatch: {:?}", config.dispatch);

    let service = Arc::new(AdapterService::new(config, Handle::current())?);
    service.start()?;

    if let Some(port) = args.admin_port {
        let state = service.admin_state();
        tokio::spawn(async move {
            if let Err(e) = start_admin_server(port, state).await {
                tracing::error!("Admin API failed: {}", e);
            }
        });
    }

    let body = match &args.input {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };
    let message = parse_headers(&args.headers, body.is_some())?;
    let input = ReplayInput {
        message,
        uri: args.uri.clone(),
        body: body.unwrap_or_default(),
        chunk_size: args.chunk_size,
    };

    let report = run_replay(&service, input).await?;
    service.stop();

    match &args.output {
        Some(path) => tokio::fs::write(path, &report.body).await?,
        None => {
            use tokio::io::AsyncWriteExt;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&report.body).await?;
            stdout.flush().await?;
        }
    }

    tracing::info!(
        "Replay finished: {} adapted bytes, aborted: {}",
        report.body.len(),
        report.aborted
    );
    Ok(report)
}
