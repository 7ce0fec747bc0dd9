//! Side-channel content hooks
//!
//! A hook is the external processing collaborator that sees a copy of every
//! intercepted message. For one transaction id, `header` and `transfer`
//! calls only happen after the transaction began, and `commit` is the last
//! call, made exactly once.

use crate::analyzer::Analyzer;
use crate::config::HookConfig;
use crate::error::HookError;
use bytes::Bytes;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub trait ContentHook: Send + Sync {
    /// Short name for log lines
    fn name(&self) -> &'static str;

    /// One-time setup when the service starts
    fn init(&self) -> Result<(), HookError> {
        Ok(())
    }

    fn header(&self, id: u64, name: &str, value: &str, uri: Option<&str>)
        -> Result<(), HookError>;

    fn transfer(&self, id: u64, chunk: &[u8], uri: Option<&str>) -> Result<(), HookError>;

    /// No more `transfer` calls will follow for `id`
    fn content_done(&self, id: u64) -> Result<(), HookError>;

    fn commit(&self, id: u64, encoding: Option<&str>, uri: Option<&str>) -> Result<(), HookError>;

    /// Next piece of adapted content the hook produced for `id`, if any
    fn get_content(&self, id: u64) -> Result<Option<Bytes>, HookError>;
}

/// Build the hook selected by the configuration
pub fn build_hook(config: &HookConfig) -> Arc<dyn ContentHook> {
    match config {
        HookConfig::None => Arc::new(NoopHook),
        HookConfig::Dump { dir } => Arc::new(DumpHook::new(dir.clone())),
        HookConfig::Analyzer { min_chunk } => Arc::new(Analyzer::new(*min_chunk)),
    }
}

/// Stands in for an absent collaborator
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl ContentHook for NoopHook {
    fn name(&self) -> &'static str {
        "none"
    }

    fn header(&self, _id: u64, _name: &str, _value: &str, _uri: Option<&str>) -> Result<(), HookError> {
        Ok(())
    }

    fn transfer(&self, _id: u64, _chunk: &[u8], _uri: Option<&str>) -> Result<(), HookError> {
        Ok(())
    }

    fn content_done(&self, _id: u64) -> Result<(), HookError> {
        Ok(())
    }

    fn commit(&self, _id: u64, _encoding: Option<&str>, _uri: Option<&str>) -> Result<(), HookError> {
        Ok(())
    }

    fn get_content(&self, _id: u64) -> Result<Option<Bytes>, HookError> {
        Err(HookError::Unavailable("get_content"))
    }
}

/// Appends every intercepted chunk to `<dir>/response-<id>.dump`
#[derive(Debug, Clone)]
pub struct DumpHook {
    dir: PathBuf,
}

impl DumpHook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dump_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("response-{}.dump", id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ContentHook for DumpHook {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn init(&self) -> Result<(), HookError> {
        std::fs::create_dir_all(&self.dir)?;
        info!("Dumping intercepted content to {}", self.dir.display());
        Ok(())
    }

    fn header(&self, _id: u64, _name: &str, _value: &str, _uri: Option<&str>) -> Result<(), HookError> {
        Ok(())
    }

    fn transfer(&self, id: u64, chunk: &[u8], _uri: Option<&str>) -> Result<(), HookError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dump_path(id))?;
        file.write_all(chunk)?;
        debug!("Xaction {}: dumped {} bytes", id, chunk.len());
        Ok(())
    }

    fn content_done(&self, _id: u64) -> Result<(), HookError> {
        Ok(())
    }

    fn commit(&self, _id: u64, _encoding: Option<&str>, _uri: Option<&str>) -> Result<(), HookError> {
        Ok(())
    }

    fn get_content(&self, _id: u64) -> Result<Option<Bytes>, HookError> {
        Err(HookError::Unavailable("get_content"))
    }
}
