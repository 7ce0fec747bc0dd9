//! Configuration types and utilities

use crate::error::AdapterError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default upper bound on the host's idle time while workers are outstanding
pub const DEFAULT_MAX_POLL_DELAY_MS: u64 = 300;

/// Adaptation service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Which content hook receives intercepted bytes
    pub hook: HookConfig,
    /// Where hook calls are executed
    pub dispatch: HookDispatch,
    /// Where adapted content comes from
    pub content_source: ContentSource,
    /// Longest idle time recommended to the host while workers run
    pub max_poll_delay_ms: u64,
    /// Total bytes all buffer queues may hold at once
    pub buffer_memory_limit: usize,
    /// Maximum number of background units running at once
    pub max_concurrent_workers: usize,
    /// Which request URLs the service adapts
    pub scope: ScopeConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            hook: HookConfig::None,
            dispatch: HookDispatch::Inline,
            content_source: ContentSource::Buffered,
            max_poll_delay_ms: DEFAULT_MAX_POLL_DELAY_MS,
            buffer_memory_limit: 64 * 1024 * 1024, // 64MB
            max_concurrent_workers: 64,
            scope: ScopeConfig::default(),
        }
    }
}

impl AdapterConfig {
    pub fn max_poll_delay(&self) -> Duration {
        Duration::from_millis(self.max_poll_delay_ms)
    }

    /// Reject settings that would stall the host or starve every transaction
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.max_poll_delay_ms == 0 {
            return Err(AdapterError::Configuration(
                "validation failed: max_poll_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.buffer_memory_limit == 0 {
            return Err(AdapterError::Configuration(
                "validation failed: buffer_memory_limit must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_workers == 0 {
            return Err(AdapterError::Configuration(
                "validation failed: max_concurrent_workers must be greater than 0".to_string(),
            ));
        }
        if let HookConfig::Analyzer { min_chunk } = self.hook {
            if min_chunk == 0 {
                return Err(AdapterError::Configuration(
                    "validation failed: analyzer min_chunk must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Content hook selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookConfig {
    /// No external collaborator
    None,
    /// Append intercepted bytes to per-transaction dump files
    Dump { dir: PathBuf },
    /// In-process content analyzer
    Analyzer { min_chunk: usize },
}

impl Default for HookConfig {
    fn default() -> Self {
        HookConfig::None
    }
}

/// Execution context for hook calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookDispatch {
    /// Hook calls run on the host thread
    Inline,
    /// Hook calls run on one background unit per transaction
    Background,
}

impl std::str::FromStr for HookDispatch {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(HookDispatch::Inline),
            "background" => Ok(HookDispatch::Background),
            other => Err(AdapterError::Configuration(format!(
                "unknown dispatch mode: {}",
                other
            ))),
        }
    }
}

/// Producer of adapted body content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    /// Virgin chunks are replayed from the transaction's buffer queue
    Buffered,
    /// The content hook produces the adapted body
    Hook,
}

impl std::str::FromStr for ContentSource {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buffered" => Ok(ContentSource::Buffered),
            "hook" => Ok(ContentSource::Hook),
            other => Err(AdapterError::Configuration(format!(
                "unknown content source: {}",
                other
            ))),
        }
    }
}

/// Scope Configuration (which hosts are adapted)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Only adapt these hosts; empty means every host
    /// Examples: ["*.example.com", "api.target.com"]
    pub allow: Vec<String>,
    /// Never adapt these hosts
    pub block: Vec<String>,
}
