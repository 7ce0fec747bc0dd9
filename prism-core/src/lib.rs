//! Prism Core Library
//!
//! This library provides the content adaptation engine a proxy host drives
//! for every intercepted message: per-message transactions, virgin body
//! buffering, side-channel content hooks, and the working/waiting
//! bookkeeping that lets background units hand results back to the host
//! thread.

pub mod admin;
pub mod analyzer;
pub mod budget;
pub mod buffer;
pub mod filter;
pub mod hook;
pub mod host;
pub mod scheduler;
pub mod service;
pub mod worker;

/// Per-message adaptation state machine
pub mod xaction;

/// Configuration types and utilities
pub mod config;

/// Error types for adaptation operations
pub mod error;

pub use admin::{AdminState, Metrics, MetricsSnapshot};
pub use analyzer::Analyzer;
pub use budget::{BudgetStats, BufferAllocation, BufferBudget};
pub use buffer::BufferQueue;
pub use config::{AdapterConfig, ContentSource, HookConfig, HookDispatch, ScopeConfig};
pub use error::{AdapterError, HookError};
pub use filter::ScopeMatcher;
pub use hook::{ContentHook, DumpHook, NoopHook};
pub use host::{Host, Message};
pub use scheduler::{Resumable, Scheduler, WorkTicket};
/// Re-export commonly used types
pub use service::AdapterService;
pub use worker::{WorkerDispatch, WorkerHandle};
pub use xaction::{OperationState, Xaction};

/// Result type alias for adaptation operations
pub type Result<T> = std::result::Result<T, AdapterError>;
