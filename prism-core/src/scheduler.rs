//! Working/waiting bookkeeping between background units and the host loop
//!
//! Background units finish on foreign threads, but only the host thread may
//! talk to the host. A finished unit therefore parks its transaction in the
//! waiting list; the host later drains that list from its own thread. The
//! working counter and the waiting list are the only state shared between
//! the two sides and are always updated under the same lock.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Something the host thread must notify once its background work ends
pub trait Resumable: Send + Sync {
    /// Diagnostic identity used in log lines
    fn resumable_id(&self) -> u64;

    /// Called on the host thread by [`Scheduler::drain_waiting`]
    fn resume(&self);
}

/// Process-wide working/waiting registry
pub struct Scheduler {
    working: AtomicUsize,
    waiting: Mutex<VecDeque<Arc<dyn Resumable>>>,
    max_poll_delay_ms: AtomicU64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("working", &self.working_count())
            .field("waiting", &self.waiting_count())
            .field("max_poll_delay", &self.max_poll_delay())
            .finish()
    }
}

impl Scheduler {
    pub fn new(max_poll_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            working: AtomicUsize::new(0),
            waiting: Mutex::new(VecDeque::new()),
            max_poll_delay_ms: AtomicU64::new(max_poll_delay.as_millis() as u64),
        })
    }

    /// Count one more unit as working. The returned ticket settles that
    /// count exactly once, however the unit ends.
    pub fn note_work_started(self: &Arc<Self>) -> WorkTicket {
        let working = self.working.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Work started, {} units working", working);
        WorkTicket {
            state: Arc::new(TicketState {
                settled: AtomicBool::new(false),
                scheduler: Arc::clone(self),
            }),
        }
    }

    /// Park `target` for the host and settle its working count.
    ///
    /// Safe to call from any thread. Does nothing if the ticket was already
    /// settled, e.g. by a transaction that was torn down first.
    pub fn note_work_finished_and_ready(&self, target: Arc<dyn Resumable>, ticket: &WorkTicket) {
        let mut waiting = self.waiting.lock();
        if !ticket.state.claim() {
            // Dropping `target` may tear it down, which takes this lock
            drop(waiting);
            debug!(
                "Xaction {} finished after its work was accounted, not queueing",
                target.resumable_id()
            );
            return;
        }
        debug_assert!(
            !waiting.iter().any(|queued| Arc::ptr_eq(queued, &target)),
            "transaction queued twice"
        );
        debug!("Xaction {} finished its work, waiting for host", target.resumable_id());
        waiting.push_back(target);
        self.working.fetch_sub(1, Ordering::AcqRel);
    }

    /// How long the host may idle before it must call [`Self::drain_waiting`].
    pub fn recommend_idle_budget(&self, requested: Duration) -> Duration {
        let waiting = self.waiting.lock();
        if !waiting.is_empty() {
            return Duration::ZERO;
        }
        if self.working.load(Ordering::Acquire) > 0 {
            // Units do not signal the host, so it has to poll for them
            return requested.min(self.max_poll_delay());
        }
        requested
    }

    /// Resume every waiting transaction in FIFO order. Host thread only.
    pub fn drain_waiting(&self) -> usize {
        let mut resumed = 0;
        loop {
            // The lock is released before resuming so units can keep queueing
            let next = self.waiting.lock().pop_front();
            let Some(target) = next else {
                break;
            };
            trace!("Resuming xaction {}", target.resumable_id());
            target.resume();
            resumed += 1;
        }
        resumed
    }

    pub fn working_count(&self) -> usize {
        self.working.load(Ordering::Acquire)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn max_poll_delay(&self) -> Duration {
        Duration::from_millis(self.max_poll_delay_ms.load(Ordering::Relaxed))
    }

    /// Applies to idle budgets recommended from now on
    pub fn set_max_poll_delay(&self, max_poll_delay: Duration) {
        self.max_poll_delay_ms
            .store(max_poll_delay.as_millis() as u64, Ordering::Relaxed);
    }

    fn settle_abandoned(&self) {
        // Same lock as queueing so idle budgets never see a half-done handoff
        let _waiting = self.waiting.lock();
        self.working.fetch_sub(1, Ordering::AcqRel);
    }
}

struct TicketState {
    settled: AtomicBool,
    scheduler: Arc<Scheduler>,
}

impl TicketState {
    fn claim(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Accounting handle for one working unit
#[derive(Clone)]
pub struct WorkTicket {
    state: Arc<TicketState>,
}

impl WorkTicket {
    /// Settle the working count without queueing anything.
    /// Returns false if the ticket was already settled.
    pub fn abandon(&self) -> bool {
        if self.state.claim() {
            self.state.scheduler.settle_abandoned();
            true
        } else {
            false
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state.settled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WorkTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkTicket")
            .field("settled", &self.is_settled())
            .finish()
    }
}
