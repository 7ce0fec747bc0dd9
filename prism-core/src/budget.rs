//! Memory accounting for buffered virgin content
//!
//! Every chunk copied into a transaction's buffer queue is charged against a
//! process-wide byte budget. Charges are released when the queue is torn down.

use crate::error::AdapterError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared byte budget for all buffer queues
#[derive(Debug, Clone)]
pub struct BufferBudget {
    /// Bytes currently held by buffer queues
    current_usage: Arc<AtomicUsize>,
    /// Maximum allowed buffered bytes
    memory_limit: usize,
}

impl BufferBudget {
    pub fn new(memory_limit: usize) -> Self {
        info!("Creating BufferBudget with memory_limit={} bytes", memory_limit);

        Self {
            current_usage: Arc::new(AtomicUsize::new(0)),
            memory_limit,
        }
    }

    /// Get current buffered bytes
    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Acquire)
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn available_memory(&self) -> usize {
        self.memory_limit.saturating_sub(self.current_usage())
    }

    /// Charge `size` bytes against the budget.
    /// The returned guard releases the charge when dropped.
    pub fn allocate(&self, size: usize) -> Result<BufferAllocation, AdapterError> {
        let mut current = self.current_usage();
        loop {
            let next = current.saturating_add(size);
            if next > self.memory_limit {
                warn!(
                    "Buffer allocation refused: requested={}, current={}, limit={}",
                    size, current, self.memory_limit
                );
                return Err(AdapterError::Resource(format!(
                    "buffer budget exhausted: {} bytes requested, {} available",
                    size,
                    self.memory_limit.saturating_sub(current)
                )));
            }
            match self.current_usage.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        debug!("Allocated {} buffer bytes, usage now {}", size, current + size);

        Ok(BufferAllocation {
            size,
            budget: self.clone(),
        })
    }

    fn release(&self, size: usize) {
        let previous = self.current_usage.fetch_sub(size, Ordering::AcqRel);
        debug!(
            "Released {} buffer bytes, usage now {}",
            size,
            previous.saturating_sub(size)
        );
    }

    pub fn get_stats(&self) -> BudgetStats {
        let current = self.current_usage();
        BudgetStats {
            current_usage: current,
            memory_limit: self.memory_limit,
            available_memory: self.available_memory(),
            usage_percent: (current as f64 / self.memory_limit as f64) * 100.0,
        }
    }
}

/// RAII charge against a [`BufferBudget`]
#[derive(Debug)]
pub struct BufferAllocation {
    size: usize,
    budget: BufferBudget,
}

impl BufferAllocation {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for BufferAllocation {
    fn drop(&mut self) {
        self.budget.release(self.size);
    }
}

/// Buffer budget statistics
#[derive(Debug, Clone)]
pub struct BudgetStats {
    pub current_usage: usize,
    pub memory_limit: usize,
    pub available_memory: usize,
    pub usage_percent: f64,
}

impl std::fmt::Display for BudgetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Buffers: {}/{} bytes ({:.1}%)",
            self.current_usage, self.memory_limit, self.usage_percent
        )
    }
}
