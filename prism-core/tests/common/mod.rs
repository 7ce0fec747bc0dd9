#![allow(dead_code)]

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH};
use parking_lot::Mutex;
use prism_core::{AdapterConfig, AdapterService, Host, Message, Xaction};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

/// One core -> host notification
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    RequestVirginBody,
    RequestMoreVirginBody,
    StopVirginBody,
    SupplyAdapted(Message),
    AdaptedAvailable,
    AdaptedDone(bool),
    Aborted,
    Resume,
}

/// A host that records every call and serves virgin bytes from a buffer
pub struct RecordingHost {
    virgin: Message,
    uri: Option<String>,
    pending: Mutex<Vec<u8>>,
    calls: Mutex<Vec<Call>>,
}

impl RecordingHost {
    pub fn new(virgin: Message) -> Arc<Self> {
        Arc::new(Self {
            virgin,
            uri: Some("http://example.com/index.html".to_string()),
            pending: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn with_body() -> Arc<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        Self::new(Message::new(headers, true))
    }

    pub fn gzip_body() -> Arc<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        Self::new(Message::new(headers, true))
    }

    pub fn without_body() -> Arc<Self> {
        Self::new(Message::new(HeaderMap::new(), false))
    }

    pub fn handle(self: &Arc<Self>) -> Weak<dyn Host> {
        Arc::downgrade(self) as Weak<dyn Host>
    }

    /// Make more virgin bytes available to the adapter
    pub fn push(&self, data: &[u8]) {
        self.pending.lock().extend_from_slice(data);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl Host for RecordingHost {
    fn virgin_message(&self) -> Message {
        self.virgin.clone()
    }

    fn cause_uri(&self) -> Option<String> {
        self.uri.clone()
    }

    fn virgin_content(&self) -> Bytes {
        Bytes::copy_from_slice(&self.pending.lock())
    }

    fn shift_virgin_content(&self, size: usize) {
        self.pending.lock().drain(..size);
    }

    fn request_virgin_body(&self) {
        self.record(Call::RequestVirginBody);
    }

    fn request_more_virgin_body(&self) {
        self.record(Call::RequestMoreVirginBody);
    }

    fn stop_virgin_body(&self) {
        self.record(Call::StopVirginBody);
    }

    fn supply_adapted_message(&self, message: Message) {
        self.record(Call::SupplyAdapted(message));
    }

    fn note_adapted_content_available(&self) {
        self.record(Call::AdaptedAvailable);
    }

    fn note_adapted_content_done(&self, at_end: bool) {
        self.record(Call::AdaptedDone(at_end));
    }

    fn note_adaptation_aborted(&self) {
        self.record(Call::Aborted);
    }

    fn resume(&self) {
        self.record(Call::Resume);
    }
}

pub fn service(config: AdapterConfig) -> AdapterService {
    let service = AdapterService::new(config, Handle::current()).unwrap();
    service.start().unwrap();
    service
}

/// Deliver `data` as one virgin chunk
pub fn feed(host: &RecordingHost, xaction: &Xaction, data: &[u8]) {
    host.push(data);
    xaction.note_virgin_available().unwrap();
}

/// Extract adapted chunks until the transaction reports none left
pub fn drain(xaction: &Xaction) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    while let Some(chunk) = xaction.adapted_content(0, usize::MAX).unwrap() {
        chunks.push(chunk);
    }
    chunks
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
