//! Error types for adaptation operations

use thiserror::Error;

/// Main error type for adaptation operations
#[derive(Debug, Error)]
pub enum AdapterError {
    /// An operation was invoked in a state that forbids it
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Buffer copy could not be accounted for
    #[error("Resource error: {0}")]
    Resource(String),

    /// The external content hook failed or is absent
    #[error("Content hook error: {0}")]
    Hook(#[from] HookError),

    /// Invalid service or agent configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn precondition(what: impl Into<String>) -> Self {
        Self::Precondition(what.into())
    }

    /// Whether the failing transaction must be aborted towards the host
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Precondition(_))
    }
}

/// Errors reported by a content hook implementation
#[derive(Debug, Error)]
pub enum HookError {
    /// No collaborator is loaded, or it does not offer the operation
    #[error("hook operation unavailable: {0}")]
    Unavailable(&'static str),

    /// Side-channel file or socket I/O failed
    #[error("hook I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Content could not be decoded or re-encoded
    #[error("content codec failed for transaction {id}: {reason}")]
    Codec { id: u64, reason: String },

    #[error("hook failed: {0}")]
    Failed(String),
}

/// Checks an adapter invariant, failing with a precondition error
pub(crate) fn must(condition: bool, what: &str) -> Result<(), AdapterError> {
    if condition {
        Ok(())
    } else {
        Err(AdapterError::precondition(what))
    }
}
