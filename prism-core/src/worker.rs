//! Background units that do hook work off the host thread

use crate::admin::Metrics;
use crate::scheduler::{Resumable, Scheduler, WorkTicket};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Launches at most one cancellable unit per transaction
#[derive(Clone)]
pub struct WorkerDispatch {
    runtime: Handle,
    permits: Arc<Semaphore>,
    max_workers: usize,
    scheduler: Arc<Scheduler>,
    metrics: Arc<Metrics>,
}

impl WorkerDispatch {
    pub fn new(
        runtime: Handle,
        max_workers: usize,
        scheduler: Arc<Scheduler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            scheduler,
            metrics,
        }
    }

    /// Number of units that could still be launched right now
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `f` on the blocking pool without tracking it
    pub(crate) fn detach_blocking<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.runtime.spawn_blocking(f));
    }

    /// Spawn `unit` for transaction `id`.
    ///
    /// When the unit completes, `target` (if still alive) is parked in the
    /// scheduler's waiting list. The unit never calls the host itself.
    /// Returns `None` without spawning when all permits are taken.
    pub fn launch<F>(&self, id: u64, target: Weak<dyn Resumable>, unit: F) -> Option<WorkerHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Xaction {}: no worker permits available ({} max), running hooks inline",
                    id, self.max_workers
                );
                self.metrics.workers_degraded.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let ticket = self.scheduler.note_work_started();
        let guard = TicketGuard(ticket.clone());
        let scheduler = Arc::clone(&self.scheduler);

        let task = self.runtime.spawn(async move {
            let _permit = permit;
            unit.await;
            match target.upgrade() {
                Some(target) => scheduler.note_work_finished_and_ready(target, &guard.0),
                None => {
                    debug!("Xaction {}: unit finished after teardown", id);
                    guard.0.abandon();
                }
            }
        });

        self.metrics.workers_launched.fetch_add(1, Ordering::Relaxed);
        debug!("Xaction {}: launched background unit", id);

        Some(WorkerHandle {
            id,
            abort: task.abort_handle(),
            ticket,
            metrics: Arc::clone(&self.metrics),
        })
    }
}

/// Settles a unit's working count if its future is dropped unfinished
struct TicketGuard(WorkTicket);

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if self.0.abandon() {
            debug!("Background unit dropped before finishing");
        }
    }
}

/// Owner-side handle to a launched unit
#[derive(Debug)]
pub struct WorkerHandle {
    id: u64,
    abort: AbortHandle,
    ticket: WorkTicket,
    metrics: Arc<Metrics>,
}

impl WorkerHandle {
    /// Request cancellation. Accounting happens when the task is dropped.
    pub fn cancel(&self) {
        if !self.abort.is_finished() {
            debug!("Xaction {}: cancelling background unit", self.id);
            self.metrics.workers_cancelled.fetch_add(1, Ordering::Relaxed);
            self.abort.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    /// Settle the unit's working count if nothing else has.
    /// Returns true if this call did the accounting.
    pub fn settle(&self) -> bool {
        self.ticket.abandon()
    }

    pub fn is_settled(&self) -> bool {
        self.ticket.is_settled()
    }
}
