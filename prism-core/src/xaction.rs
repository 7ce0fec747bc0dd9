//! Adaptation transaction: one virgin message in, one adapted message out
//!
//! The host drives a transaction from its own thread. Virgin body chunks are
//! copied into the transaction's [`BufferQueue`] and forwarded to the content
//! hook, either inline or through a background unit. Adapted content is
//! pulled by the host through [`Xaction::adapted_content`].
//!
//! The host handle is weak and is cleared exactly once: by the last host
//! call, by [`Xaction::stop`], or on teardown. No lock is held while the
//! host is called, so the host may call back into the transaction.

use crate::admin::Metrics;
use crate::budget::BufferBudget;
use crate::buffer::BufferQueue;
use crate::config::{ContentSource, HookConfig, HookDispatch};
use crate::error::{must, AdapterError, HookError};
use crate::hook::ContentHook;
use crate::host::{Host, Message};
use crate::scheduler::Resumable;
use crate::worker::{WorkerDispatch, WorkerHandle};
use crate::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

static NEXT_XACTION_ID: AtomicU64 = AtomicU64::new(0);

/// Progress of virgin body reception or adapted body production
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Undecided,
    On,
    Complete,
    Never,
}

/// Service-wide collaborators shared by every transaction
pub struct XactionContext {
    pub(crate) dispatch: WorkerDispatch,
    pub(crate) hook: Arc<dyn ContentHook>,
    pub(crate) hook_config: HookConfig,
    pub(crate) budget: BufferBudget,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) hook_dispatch: HookDispatch,
    pub(crate) content_source: ContentSource,
}

/// A side-channel call for one transaction
#[derive(Debug)]
enum HookCall {
    Header {
        name: String,
        value: String,
        uri: Option<String>,
    },
    Transfer {
        chunk: Bytes,
        uri: Option<String>,
    },
    ContentDone,
    Commit {
        encoding: Option<String>,
        uri: Option<String>,
    },
}

impl HookCall {
    /// Nothing but a commit may follow this call
    fn ends_content(&self) -> bool {
        matches!(self, HookCall::ContentDone | HookCall::Commit { .. })
    }
}

/// Serializes hook calls for one transaction and drops any call made after
/// the commit, which keeps `commit` last even when a unit is cancelled
/// mid-call.
struct HookLane {
    id: u64,
    hook: Arc<dyn ContentHook>,
    metrics: Arc<Metrics>,
    committed: Mutex<bool>,
    /// Set by the first failed hook call
    failed: AtomicBool,
}

impl HookLane {
    fn apply(&self, call: HookCall) {
        let mut committed = self.committed.lock();
        self.apply_locked(&mut committed, call);
    }

    fn apply_locked(&self, committed: &mut bool, call: HookCall) {
        if *committed {
            debug!("Xaction {}: dropping {:?} issued after commit", self.id, call);
            return;
        }
        let result = match call {
            HookCall::Header { name, value, uri } => {
                self.hook.header(self.id, &name, &value, uri.as_deref())
            }
            HookCall::Transfer { chunk, uri } => self.hook.transfer(self.id, &chunk, uri.as_deref()),
            HookCall::ContentDone => self.hook.content_done(self.id),
            HookCall::Commit { encoding, uri } => {
                *committed = true;
                self.hook.commit(self.id, encoding.as_deref(), uri.as_deref())
            }
        };
        if let Err(e) = result {
            self.note_failure(&e);
        }
    }

    /// Apply without waiting on an in-flight hook call; if the lane is
    /// busy the call runs on the blocking pool once it frees up.
    fn apply_soon(self: &Arc<Self>, dispatch: &WorkerDispatch, call: HookCall) {
        match self.committed.try_lock() {
            Some(mut committed) => self.apply_locked(&mut committed, call),
            None => {
                let lane = Arc::clone(self);
                dispatch.detach_blocking(move || lane.apply(call));
            }
        }
    }

    fn note_failure(&self, e: &HookError) {
        warn!("Xaction {}: {} hook failed: {}", self.id, self.hook.name(), e);
        self.failed.store(true, Ordering::Release);
        self.metrics.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Drains hook calls in arrival order until content ends
async fn run_hook_unit(lane: Arc<HookLane>, mut calls: mpsc::UnboundedReceiver<HookCall>) {
    async fn apply(lane: &Arc<HookLane>, call: HookCall) {
        let lane = Arc::clone(lane);
        // Hook I/O may block
        if let Err(e) = tokio::task::spawn_blocking(move || lane.apply(call)).await {
            warn!("Hook call task failed: {}", e);
        }
    }

    while let Some(call) = calls.recv().await {
        let last = call.ends_content();
        apply(&lane, call).await;
        if last {
            // Anything sent from now on runs inline on the sender's side
            calls.close();
            while let Ok(call) = calls.try_recv() {
                apply(&lane, call).await;
            }
            break;
        }
    }
}

struct Worker {
    handle: WorkerHandle,
    calls: mpsc::UnboundedSender<HookCall>,
}

struct Inner {
    host: Option<Weak<dyn Host>>,
    stopped: bool,
    receiving: OperationState,
    sending: OperationState,
    adapted: Option<Message>,
    buffers: BufferQueue,
    uri_captured: bool,
    request_uri: Option<String>,
    worker: Option<Worker>,
    virgin_at_end: Option<bool>,
    /// Adapted-done notification held back until the unit finishes
    done_pending: Option<bool>,
    hook_delivered: bool,
    hook_failed: bool,
    consumed: usize,
}

impl Inner {
    fn live_host(&self) -> Option<Arc<dyn Host>> {
        self.host.as_ref().and_then(Weak::upgrade)
    }

    fn required_host(&self) -> Result<Arc<dyn Host>> {
        self.live_host()
            .ok_or_else(|| AdapterError::precondition("host transaction is not attached"))
    }

    /// Release the host handle; the returned host must be called only once
    fn last_host_call(&mut self) -> Option<Arc<dyn Host>> {
        self.host.take().and_then(|host| host.upgrade())
    }

    fn worker_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.handle.is_settled())
    }

    fn commit_args(&self) -> (Option<String>, Option<String>) {
        let encoding = self
            .adapted
            .as_ref()
            .and_then(|message| message.content_encoding())
            .map(str::to_string);
        (encoding, self.request_uri.clone())
    }
}

/// One adaptation job bound to one host transaction
pub struct Xaction {
    id: u64,
    context: Arc<XactionContext>,
    lane: Arc<HookLane>,
    weak_self: Weak<Xaction>,
    inner: Mutex<Inner>,
}

impl Xaction {
    pub(crate) fn new(context: Arc<XactionContext>, host: Weak<dyn Host>) -> Arc<Self> {
        let id = NEXT_XACTION_ID.fetch_add(1, Ordering::Relaxed);
        context.metrics.xactions_created.fetch_add(1, Ordering::Relaxed);
        debug!("Xaction {}: created", id);

        let lane = Arc::new(HookLane {
            id,
            hook: Arc::clone(&context.hook),
            metrics: Arc::clone(&context.metrics),
            committed: Mutex::new(false),
            failed: AtomicBool::new(false),
        });

        Arc::new_cyclic(|weak_self| Self {
            id,
            context,
            lane,
            weak_self: weak_self.clone(),
            inner: Mutex::new(Inner {
                host: Some(host),
                stopped: false,
                receiving: OperationState::Undecided,
                sending: OperationState::Undecided,
                adapted: None,
                buffers: BufferQueue::new(),
                uri_captured: false,
                request_uri: None,
                worker: None,
                virgin_at_end: None,
                done_pending: None,
                hook_delivered: false,
                hook_failed: false,
                consumed: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn receiving_vb(&self) -> OperationState {
        self.inner.lock().receiving
    }

    pub fn sending_ab(&self) -> OperationState {
        self.inner.lock().sending
    }

    /// Whether the host handle has not been released yet
    pub fn is_host_attached(&self) -> bool {
        self.inner.lock().host.is_some()
    }

    /// Whether a background unit is still doing work for this transaction
    pub fn has_pending_work(&self) -> bool {
        self.inner.lock().worker_running()
    }

    /// Adapted bytes the host reported as consumed
    pub fn consumed_bytes(&self) -> usize {
        self.inner.lock().consumed
    }

    /// Start adapting: request the virgin body and hand the adapted
    /// envelope to the host.
    pub fn begin(&self) -> Result<()> {
        self.guarded("begin", |this| this.do_begin())
    }

    fn do_begin(&self) -> Result<()> {
        let host = {
            let inner = self.inner.lock();
            let host = inner.required_host()?;
            must(
                inner.receiving == OperationState::Undecided
                    && inner.sending == OperationState::Undecided,
                "begin called more than once",
            )?;
            host
        };

        let virgin = host.virgin_message();
        let adapted = virgin.without_framing();
        info!(
            "Xaction {}: begin, virgin body: {}",
            self.id,
            if virgin.has_body { "yes" } else { "no" }
        );

        let mut inner = self.inner.lock();
        if virgin.has_body {
            inner.receiving = OperationState::On;
            self.launch_worker(&mut inner);
        } else {
            inner.receiving = OperationState::Never;
        }

        if !adapted.has_body {
            inner.sending = OperationState::Never;
            inner.adapted = Some(adapted.clone());
            let last = inner.last_host_call();
            drop(inner);
            if let Some(host) = last {
                host.supply_adapted_message(adapted);
            }
            return Ok(());
        }

        inner.adapted = Some(adapted.clone());
        drop(inner);

        host.request_virgin_body();
        host.supply_adapted_message(adapted);
        Ok(())
    }

    fn launch_worker(&self, inner: &mut Inner) {
        if self.context.hook_dispatch != HookDispatch::Background {
            return;
        }
        let (calls, receiver) = mpsc::unbounded_channel();
        let unit = run_hook_unit(Arc::clone(&self.lane), receiver);
        let target: Weak<dyn Resumable> = self.weak_self.clone();
        if let Some(handle) = self.context.dispatch.launch(self.id, target, unit) {
            inner.worker = Some(Worker { handle, calls });
        }
    }

    /// Route a hook call to the background unit, or run it here
    fn forward(&self, inner: &Inner, call: HookCall) {
        let call = match &inner.worker {
            Some(worker) => match worker.calls.send(call) {
                Ok(()) => return,
                Err(mpsc::error::SendError(call)) => call,
            },
            None => call,
        };
        self.lane.apply(call);
    }

    /// The host has virgin body bytes for us
    pub fn note_virgin_available(&self) -> Result<()> {
        self.guarded("note_virgin_available", |this| this.do_note_virgin_available())
    }

    fn do_note_virgin_available(&self) -> Result<()> {
        let (host, capture_uri) = {
            let inner = self.inner.lock();
            must(
                inner.receiving == OperationState::On,
                "virgin content arrived while receivingVb is not on",
            )?;
            (inner.required_host()?, !inner.uri_captured)
        };

        let request_uri = if capture_uri { host.cause_uri() } else { None };
        let virgin = host.virgin_content();
        host.shift_virgin_content(virgin.len());

        let notify = {
            let mut inner = self.inner.lock();
            if inner.host.is_none() {
                return Ok(());
            }

            if capture_uri && !inner.uri_captured {
                inner.uri_captured = true;
                inner.request_uri = request_uri;
                self.forward_headers(&inner);
            }

            self.context.metrics.virgin_chunks.fetch_add(1, Ordering::Relaxed);
            self.context
                .metrics
                .virgin_bytes
                .fetch_add(virgin.len() as u64, Ordering::Relaxed);

            match inner.buffers.append(&virgin, &self.context.budget) {
                Ok(copy) => {
                    debug!("Xaction {}: queued {} virgin bytes", self.id, copy.len());
                    let uri = inner.request_uri.clone();
                    self.forward(&inner, HookCall::Transfer { chunk: copy, uri });
                }
                Err(e) => {
                    warn!(
                        "Xaction {}: {}; queueing an empty chunk instead. {}",
                        self.id,
                        e,
                        self.context.budget.get_stats()
                    );
                    self.context
                        .metrics
                        .budget_rejections
                        .fetch_add(1, Ordering::Relaxed);
                    inner.buffers.append_empty();
                }
            }

            inner.sending == OperationState::On
        };

        if notify {
            host.note_adapted_content_available();
        }
        Ok(())
    }

    fn forward_headers(&self, inner: &Inner) {
        let Some(adapted) = &inner.adapted else {
            return;
        };
        for (name, value) in adapted.headers.iter() {
            self.forward(
                inner,
                HookCall::Header {
                    name: name.as_str().to_string(),
                    value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    uri: inner.request_uri.clone(),
                },
            );
        }
    }

    /// Stop pulling virgin body. Returns true if the host must be told.
    fn stop_virgin(&self, inner: &mut Inner) -> bool {
        if inner.receiving != OperationState::On {
            return false;
        }
        inner.receiving = OperationState::Complete;
        self.forward(inner, HookCall::ContentDone);
        true
    }

    /// Hold back adapted completion while the hook still produces content
    fn completion_deferred(&self, inner: &Inner) -> bool {
        self.context.content_source == ContentSource::Hook && inner.worker_running()
    }

    /// The host will deliver no more virgin body bytes
    pub fn note_virgin_done(&self, at_end: bool) -> Result<()> {
        self.guarded("note_virgin_done", |this| this.do_note_virgin_done(at_end))
    }

    fn do_note_virgin_done(&self, at_end: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        must(
            inner.receiving == OperationState::On,
            "virgin body ended while receivingVb is not on",
        )?;
        let host = inner.required_host()?;

        inner.virgin_at_end = Some(at_end);
        let stop = self.stop_virgin(&mut inner);
        let done_now = if inner.sending == OperationState::On {
            if self.completion_deferred(&inner) {
                inner.done_pending = Some(at_end);
                None
            } else {
                inner.sending = OperationState::Complete;
                Some(at_end)
            }
        } else {
            None
        };
        debug!(
            "Xaction {}: virgin body done (at_end={}), {} chunks queued",
            self.id,
            at_end,
            inner.buffers.len()
        );
        drop(inner);

        if stop {
            host.stop_virgin_body();
        }
        if let Some(at_end) = done_now {
            host.note_adapted_content_done(at_end);
        }
        Ok(())
    }

    /// The host wants more adapted body (abMakeMore)
    pub fn request_more(&self) -> Result<()> {
        self.guarded("request_more", |this| {
            let host = {
                let inner = this.inner.lock();
                if inner.receiving != OperationState::On {
                    return Ok(());
                }
                inner.required_host()?
            };
            host.request_more_virgin_body();
            Ok(())
        })
    }

    /// The host does not want an adapted body (abDiscard)
    pub fn decline_adapted_body(&self) -> Result<()> {
        self.guarded("decline_adapted_body", |this| {
            let mut inner = this.inner.lock();
            must(
                inner.sending == OperationState::Undecided,
                "adapted body declined after it was decided",
            )?;
            inner.sending = OperationState::Never;
            let stop = this.stop_virgin(&mut inner);
            let host = inner.live_host();
            drop(inner);

            if let (true, Some(host)) = (stop, host) {
                host.stop_virgin_body();
            }
            Ok(())
        })
    }

    /// The host wants the adapted body (abMake)
    pub fn request_adapted_body(&self) -> Result<()> {
        self.guarded("request_adapted_body", |this| this.do_request_adapted_body())
    }

    fn do_request_adapted_body(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        must(
            inner.sending == OperationState::Undecided,
            "adapted body requested after it was decided",
        )?;
        must(
            matches!(
                inner.receiving,
                OperationState::On | OperationState::Complete
            ),
            "adapted body requested without a virgin body",
        )?;
        let host = inner.required_host()?;

        inner.sending = OperationState::On;
        let available = inner.buffers.has_pending();
        let mut done_now = None;
        if inner.receiving == OperationState::Complete {
            let at_end = inner.virgin_at_end.unwrap_or(true);
            if self.completion_deferred(&inner) {
                inner.done_pending = Some(at_end);
            } else {
                inner.sending = OperationState::Complete;
                done_now = Some(at_end);
            }
        }
        drop(inner);

        if available {
            host.note_adapted_content_available();
        }
        if let Some(at_end) = done_now {
            host.note_adapted_content_done(at_end);
        }
        Ok(())
    }

    /// The host will not take more adapted body (abStopMaking)
    pub fn stop_adapted_body(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let stop = self.stop_virgin(&mut inner);
        if inner.sending == OperationState::On {
            inner.sending = OperationState::Complete;
        }
        let host = inner.live_host();
        drop(inner);

        if let (true, Some(host)) = (stop, host) {
            host.stop_virgin_body();
        }
        Ok(())
    }

    /// Next chunk of adapted content, `None` when nothing is left to extract.
    ///
    /// Whole chunks are returned; `offset` and `size` are advisory.
    pub fn adapted_content(&self, offset: usize, size: usize) -> Result<Option<Bytes>> {
        self.guarded("adapted_content", |this| this.do_adapted_content(offset, size))
    }

    fn do_adapted_content(&self, offset: usize, size: usize) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();
        must(
            matches!(
                inner.sending,
                OperationState::On | OperationState::Complete
            ),
            "adapted content extracted while sendingAb is not on",
        )?;
        trace!("Xaction {}: adapted content at {}+{}", self.id, offset, size);

        if self.context.content_source == ContentSource::Hook
            && !inner.hook_failed
            && !inner.hook_delivered
            && self.lane.has_failed()
        {
            warn!(
                "Xaction {}: hook failed before producing content, serving buffered virgin content",
                self.id
            );
            inner.hook_failed = true;
        }

        let chunk = if self.context.content_source == ContentSource::Hook && !inner.hook_failed {
            match self.context.hook.get_content(self.id) {
                Ok(chunk) => {
                    inner.hook_delivered |= chunk.is_some();
                    chunk
                }
                Err(e) => {
                    self.lane.note_failure(&e);
                    if inner.hook_delivered {
                        None
                    } else {
                        warn!("Xaction {}: serving buffered virgin content instead", self.id);
                        inner.hook_failed = true;
                        inner.buffers.next()
                    }
                }
            }
        } else {
            inner.buffers.next()
        };

        if chunk.is_some() {
            self.context.metrics.adapted_chunks.fetch_add(1, Ordering::Relaxed);
        }
        Ok(chunk)
    }

    /// The host copied `size` adapted bytes
    pub fn consume_adapted_content(&self, size: usize) -> Result<()> {
        self.guarded("consume_adapted_content", |this| {
            let mut inner = this.inner.lock();
            must(
                matches!(
                    inner.sending,
                    OperationState::On | OperationState::Complete
                ),
                "adapted content consumed while sendingAb is not on",
            )?;
            inner.consumed += size;
            Ok(())
        })
    }

    /// The host lost interest. Safe in any state; only the first call acts.
    pub fn stop(&self) {
        let (encoding, uri) = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.host = None;
            if let Some(worker) = &inner.worker {
                worker.handle.cancel();
            }
            inner.commit_args()
        };
        info!("Xaction {}: stopped by host", self.id);
        self.lane
            .apply_soon(&self.context.dispatch, HookCall::Commit { encoding, uri });
    }

    /// Run `op`, turning a precondition failure into an abort towards the host
    fn guarded<T>(&self, op: &str, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        match f(self) {
            Err(e) if e.is_fatal() => {
                error!("Xaction {}: {} failed: {}", self.id, op, e);
                self.abort();
                Err(e)
            }
            other => other,
        }
    }

    /// Cancel the unit and commit now; calls still queued for the unit are
    /// lost with it, so teardown must not route the commit through it.
    fn abort(&self) {
        let (host, commit) = {
            let mut inner = self.inner.lock();
            if let Some(worker) = &inner.worker {
                worker.handle.cancel();
            }
            let commit = if inner.stopped {
                None
            } else {
                inner.stopped = true;
                Some(inner.commit_args())
            };
            (inner.last_host_call(), commit)
        };
        if let Some(host) = host {
            self.context.metrics.xactions_aborted.fetch_add(1, Ordering::Relaxed);
            host.note_adaptation_aborted();
        }
        if let Some((encoding, uri)) = commit {
            self.lane
                .apply_soon(&self.context.dispatch, HookCall::Commit { encoding, uri });
        }
    }
}

impl Resumable for Xaction {
    fn resumable_id(&self) -> u64 {
        self.id
    }

    fn resume(&self) {
        let (host, available, done) = {
            let mut inner = self.inner.lock();
            let Some(host) = inner.live_host() else {
                debug!("Xaction {}: work finished after the host let go", self.id);
                return;
            };
            let sending = inner.sending == OperationState::On;
            let done = inner.done_pending.take();
            if done.is_some() {
                inner.sending = OperationState::Complete;
            }
            let available = sending
                && (inner.buffers.has_pending()
                    || self.context.content_source == ContentSource::Hook);
            (host, available, done)
        };

        debug!("Xaction {}: resuming host", self.id);
        host.resume();
        if available {
            host.note_adapted_content_available();
        }
        if let Some(at_end) = done {
            host.note_adapted_content_done(at_end);
        }
    }
}

impl Drop for Xaction {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        if let Some(host) = inner.last_host_call() {
            warn!("Xaction {}: destroyed while the host was attached", self.id);
            self.context.metrics.xactions_aborted.fetch_add(1, Ordering::Relaxed);
            host.note_adaptation_aborted();
        }

        let worker = inner.worker.take();
        if inner.stopped {
            // Already committed; only the unit accounting may be left
            if let Some(worker) = worker {
                if worker.handle.is_finished() {
                    worker.handle.settle();
                }
            }
        } else {
            let (encoding, uri) = inner.commit_args();
            let commit = HookCall::Commit { encoding, uri };
            let commit = match worker {
                // A live unit commits after the calls it already holds
                Some(worker) => match worker.calls.send(commit) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(commit)) => {
                        if worker.handle.is_finished() {
                            worker.handle.settle();
                        }
                        Some(commit)
                    }
                },
                None => Some(commit),
            };
            if let Some(commit) = commit {
                self.lane.apply_soon(&self.context.dispatch, commit);
            }
        }

        debug!(
            "Xaction {}: destroyed, releasing {} queued chunks",
            self.id,
            inner.buffers.len()
        );
    }
}
