//! Single-message host loop

use bytes::Bytes;
use parking_lot::Mutex;
use prism_core::{AdapterService, Host, Message, OperationState};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the loop asks to idle when it has nothing to do
const IDLE_REQUEST: Duration = Duration::from_millis(50);

/// One message to push through the adapter
#[derive(Debug, Clone)]
pub struct ReplayInput {
    pub message: Message,
    pub uri: String,
    pub body: Vec<u8>,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Adapted envelope, `None` when the URL was out of scope
    pub adapted: Option<Message>,
    pub body: Vec<u8>,
    pub at_end: Option<bool>,
    pub aborted: bool,
    pub resumes: usize,
}

#[derive(Debug, Default)]
struct HostState {
    offset: usize,
    available: Vec<u8>,
    body_requested: bool,
    virgin_stopped: bool,
    more_requests: usize,
    adapted: Option<Message>,
    adapted_done: Option<bool>,
    aborted: bool,
    resumes: usize,
}

/// Host side of one replayed transaction
pub struct ReplayHost {
    virgin: Message,
    uri: String,
    body: Bytes,
    chunk_size: usize,
    state: Mutex<HostState>,
}

impl ReplayHost {
    pub fn new(input: ReplayInput) -> Arc<Self> {
        Arc::new(Self {
            virgin: input.message,
            uri: input.uri,
            body: Bytes::from(input.body),
            chunk_size: input.chunk_size.max(1),
            state: Mutex::new(HostState::default()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> Weak<dyn Host> {
        Arc::downgrade(self) as Weak<dyn Host>
    }

    fn body_wanted(&self) -> bool {
        let state = self.state.lock();
        state.body_requested && !state.virgin_stopped
    }

    /// Make the next virgin chunk available. Returns false once the body is
    /// exhausted.
    fn deliver_next(&self) -> bool {
        let mut state = self.state.lock();
        if state.offset >= self.body.len() {
            return false;
        }
        let end = (state.offset + self.chunk_size).min(self.body.len());
        let chunk = self.body.slice(state.offset..end);
        state.offset = end;
        state.available.extend_from_slice(&chunk);
        true
    }

    fn adapted_has_body(&self) -> bool {
        self.state
            .lock()
            .adapted
            .as_ref()
            .map_or(false, |message| message.has_body)
    }

    fn adapted_done(&self) -> Option<bool> {
        self.state.lock().adapted_done
    }

    fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}

impl Host for ReplayHost {
    fn virgin_message(&self) -> Message {
        self.virgin.clone()
    }

    fn cause_uri(&self) -> Option<String> {
        Some(self.uri.clone())
    }

    fn virgin_content(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().available)
    }

    fn shift_virgin_content(&self, size: usize) {
        let mut state = self.state.lock();
        let size = size.min(state.available.len());
        state.available.drain(..size);
    }

    fn request_virgin_body(&self) {
        self.state.lock().body_requested = true;
    }

    fn request_more_virgin_body(&self) {
        self.state.lock().more_requests += 1;
    }

    fn stop_virgin_body(&self) {
        self.state.lock().virgin_stopped = true;
    }

    fn supply_adapted_message(&self, message: Message) {
        debug!("Adapted message supplied, body: {}", message.has_body);
        self.state.lock().adapted = Some(message);
    }

    fn note_adapted_content_available(&self) {}

    fn note_adapted_content_done(&self, at_end: bool) {
        self.state.lock().adapted_done = Some(at_end);
    }

    fn note_adaptation_aborted(&self) {
        warn!("Adaptation aborted");
        self.state.lock().aborted = true;
    }

    fn resume(&self) {
        self.state.lock().resumes += 1;
    }
}

/// Drive one message through `service` the way a proxy would
pub async fn run_replay(
    service: &AdapterService,
    input: ReplayInput,
) -> prism_core::Result<ReplayReport> {
    let host = ReplayHost::new(input);

    if !service.wants_url(&host.uri) {
        info!("{} is out of scope, passing the body through", host.uri);
        return Ok(ReplayReport {
            body: host.body.to_vec(),
            ..Default::default()
        });
    }

    let xaction = service.make_xaction(host.handle());
    xaction.begin()?;
    if host.adapted_has_body() {
        xaction.request_adapted_body()?;
    }

    let mut body = Vec::new();
    loop {
        let mut progressed = false;

        if xaction.receiving_vb() == OperationState::On && host.body_wanted() {
            if host.deliver_next() {
                xaction.note_virgin_available()?;
            } else {
                xaction.note_virgin_done(true)?;
            }
            progressed = true;
        }

        if matches!(
            xaction.sending_ab(),
            OperationState::On | OperationState::Complete
        ) {
            while let Some(chunk) = xaction.adapted_content(body.len(), usize::MAX)? {
                xaction.consume_adapted_content(chunk.len())?;
                body.extend_from_slice(&chunk);
                progressed = true;
            }
        }

        if host.is_aborted() {
            break;
        }
        let finished = match xaction.sending_ab() {
            OperationState::Never => true,
            OperationState::Complete => {
                !progressed
                    && host.adapted_done().is_some()
                    && !xaction.has_pending_work()
                    && service.scheduler().waiting_count() == 0
            }
            _ => false,
        };
        if finished {
            break;
        }

        if !progressed {
            let idle = service.suspend(IDLE_REQUEST);
            if !idle.is_zero() {
                tokio::time::sleep(idle).await;
            }
            service.resume();
        }
    }

    xaction.stop();
    drop(xaction);
    // Work that ended during teardown no longer reaches the host
    service.resume();

    let state = host.state.lock();
    Ok(ReplayReport {
        adapted: state.adapted.clone(),
        body,
        at_end: state.adapted_done,
        aborted: state.aborted,
        resumes: state.resumes,
    })
}
