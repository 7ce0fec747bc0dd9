//! In-process content analyzer hook
//!
//! Collects the headers and body bytes of every transaction and hands the
//! body back as adapted content. Identity bodies are released in batches of
//! at least `min_chunk` bytes. Gzip bodies are decoded and re-encoded as they
//! stream, so the adapted body is a fresh gzip stream of the same content.

use crate::error::HookError;
use crate::hook::ContentHook;
use bytes::Bytes;
use dashmap::DashMap;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, info, warn};

/// Default batch size for identity bodies
pub const DEFAULT_MIN_CHUNK: usize = 128;

type GzPipeline = GzDecoder<GzEncoder<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Encoding {
    Identity,
    Gzip,
    /// Passed through untouched
    Other(String),
}

impl Encoding {
    fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Encoding::Identity,
            "gzip" | "x-gzip" => Encoding::Gzip,
            other => Encoding::Other(other.to_string()),
        }
    }
}

struct Entry {
    headers: HashMap<String, String>,
    encoding: Encoding,
    pending: Vec<u8>,
    pipeline: Option<GzPipeline>,
    received: usize,
    served: usize,
    done: bool,
    /// First codec failure; the entry yields no content after it
    poisoned: Option<String>,
}

impl Entry {
    fn new() -> Self {
        Self {
            headers: HashMap::new(),
            encoding: Encoding::Identity,
            pending: Vec::new(),
            pipeline: None,
            received: 0,
            served: 0,
            done: false,
            poisoned: None,
        }
    }

    fn poison(&mut self, id: u64, e: std::io::Error) -> HookError {
        let reason = e.to_string();
        self.pipeline = None;
        self.poisoned = Some(reason.clone());
        HookError::Codec { id, reason }
    }

    fn poisoned_error(&self, id: u64) -> Option<HookError> {
        self.poisoned.as_ref().map(|reason| HookError::Codec {
            id,
            reason: reason.clone(),
        })
    }

    fn pipeline(&mut self) -> &mut GzPipeline {
        self.pipeline.get_or_insert_with(|| {
            GzDecoder::new(GzEncoder::new(Vec::new(), Compression::default()))
        })
    }
}

pub struct Analyzer {
    min_chunk: usize,
    entries: DashMap<u64, Entry>,
}

impl Analyzer {
    pub fn new(min_chunk: usize) -> Self {
        Self {
            min_chunk,
            entries: DashMap::new(),
        }
    }

    /// Number of transactions with live state
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Header recorded for `id`, matched case-insensitively
    pub fn header_value(&self, id: u64, name: &str) -> Option<String> {
        let entry = self.entries.get(&id)?;
        entry
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CHUNK)
    }
}

impl ContentHook for Analyzer {
    fn name(&self) -> &'static str {
        "analyzer"
    }

    fn init(&self) -> Result<(), HookError> {
        info!("Analyzer ready, min_chunk={}", self.min_chunk);
        Ok(())
    }

    fn header(&self, id: u64, name: &str, value: &str, uri: Option<&str>) -> Result<(), HookError> {
        debug!("Xaction {}: HEADER {} -> {} (uri: {:?})", id, name, value, uri);
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        if name.eq_ignore_ascii_case("content-encoding") {
            if entry.received > 0 {
                warn!("Xaction {}: content encoding announced after body bytes, ignoring", id);
            } else {
                entry.encoding = Encoding::from_header(value);
            }
        }
        entry.headers.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn transfer(&self, id: u64, chunk: &[u8], _uri: Option<&str>) -> Result<(), HookError> {
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        if entry.done {
            return Err(HookError::Failed(format!(
                "transfer after content done for transaction {}",
                id
            )));
        }
        if let Some(e) = entry.poisoned_error(id) {
            return Err(e);
        }
        entry.received += chunk.len();
        if entry.encoding == Encoding::Gzip {
            if let Err(e) = entry.pipeline().write_all(chunk) {
                return Err(entry.poison(id, e));
            }
        } else {
            entry.pending.extend_from_slice(chunk);
        }
        Ok(())
    }

    fn content_done(&self, id: u64) -> Result<(), HookError> {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Ok(());
        };
        entry.done = true;
        if let Some(e) = entry.poisoned_error(id) {
            return Err(e);
        }
        if let Some(pipeline) = entry.pipeline.as_mut() {
            let finished = pipeline
                .try_finish()
                .and_then(|()| pipeline.get_mut().try_finish());
            if let Err(e) = finished {
                return Err(entry.poison(id, e));
            }
        }
        debug!("Xaction {}: content done after {} bytes", id, entry.received);
        Ok(())
    }

    fn commit(&self, id: u64, encoding: Option<&str>, uri: Option<&str>) -> Result<(), HookError> {
        if let Some((_, entry)) = self.entries.remove(&id) {
            info!(
                "Xaction {}: committed {} bytes in, {} bytes out, encoding {:?}, uri {:?}",
                id, entry.received, entry.served, encoding, uri
            );
        }
        Ok(())
    }

    fn get_content(&self, id: u64) -> Result<Option<Bytes>, HookError> {
        let Some(mut guard) = self.entries.get_mut(&id) else {
            return Ok(None);
        };
        let entry = &mut *guard;
        if let Some(e) = entry.poisoned_error(id) {
            return Err(e);
        }

        let output = match entry.pipeline.as_mut() {
            Some(pipeline) => std::mem::take(pipeline.get_mut().get_mut()),
            None => {
                if entry.pending.len() < self.min_chunk && !entry.done {
                    return Ok(None);
                }
                std::mem::take(&mut entry.pending)
            }
        };

        if output.is_empty() {
            return Ok(None);
        }
        entry.served += output.len();
        Ok(Some(Bytes::from(output)))
    }
}
