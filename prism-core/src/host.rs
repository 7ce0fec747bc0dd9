//! The proxy-facing boundary of an adaptation transaction

use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH};

/// Page-level envelope of an HTTP message as the host exposes it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub headers: HeaderMap,
    /// Whether the message carries a body (possibly still streaming)
    pub has_body: bool,
}

impl Message {
    pub fn new(headers: HeaderMap, has_body: bool) -> Self {
        Self { headers, has_body }
    }

    /// Copy of this message without Content-Length framing, since the
    /// adapted body may differ in length.
    pub fn without_framing(&self) -> Self {
        let mut adapted = self.clone();
        adapted.headers.remove(CONTENT_LENGTH);
        adapted
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
    }
}

/// Host transaction as seen by the adapter.
///
/// Implemented by the proxy. Every method is called from the host thread
/// only, and never after the adapter released its handle.
pub trait Host: Send + Sync {
    /// The virgin message being adapted
    fn virgin_message(&self) -> Message;

    /// Request target of the message that caused this one, if known
    fn cause_uri(&self) -> Option<String>;

    /// All virgin body bytes currently available
    fn virgin_content(&self) -> Bytes;

    /// The adapter no longer needs the first `size` virgin bytes
    fn shift_virgin_content(&self, size: usize);

    fn request_virgin_body(&self);
    fn request_more_virgin_body(&self);
    fn stop_virgin_body(&self);

    fn supply_adapted_message(&self, message: Message);
    fn note_adapted_content_available(&self);
    fn note_adapted_content_done(&self, at_end: bool);
    fn note_adaptation_aborted(&self);

    /// Asynchronous work for this transaction finished
    fn resume(&self);
}
