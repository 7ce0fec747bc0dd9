//! Ordered chunk queue between virgin delivery and adapted extraction

use crate::budget::{BufferAllocation, BufferBudget};
use crate::error::AdapterError;
use bytes::Bytes;

/// One queued chunk and the budget charge for its bytes
#[derive(Debug)]
struct Node {
    bytes: Bytes,
    _allocation: Option<BufferAllocation>,
}

/// Append-only chunk queue with a single forward cursor.
///
/// Consuming a chunk only moves the cursor; the bytes stay owned by the
/// queue until it is dropped, so every appended node is released exactly
/// once whether or not it was extracted.
#[derive(Debug, Default)]
pub struct BufferQueue {
    nodes: Vec<Node>,
    cursor: usize,
    appended_bytes: usize,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `data` into a new tail node charged against `budget`.
    ///
    /// Returns a handle to the queued copy. Nothing is queued on failure.
    pub fn append(&mut self, data: &[u8], budget: &BufferBudget) -> Result<Bytes, AdapterError> {
        let allocation = budget.allocate(data.len())?;
        let bytes = Bytes::copy_from_slice(data);
        self.appended_bytes += bytes.len();
        self.nodes.push(Node {
            bytes: bytes.clone(),
            _allocation: Some(allocation),
        });
        Ok(bytes)
    }

    /// Queue a zero-length chunk in place of content that could not be kept
    pub fn append_empty(&mut self) {
        self.nodes.push(Node {
            bytes: Bytes::new(),
            _allocation: None,
        });
    }

    /// Return the chunk at the cursor and advance past it.
    /// `None` means every appended chunk has been extracted.
    pub fn next(&mut self) -> Option<Bytes> {
        let node = self.nodes.get(self.cursor)?;
        self.cursor += 1;
        Some(node.bytes.clone())
    }

    /// Whether chunks remain past the cursor
    pub fn has_pending(&self) -> bool {
        self.cursor < self.nodes.len()
    }

    pub fn pending_chunks(&self) -> usize {
        self.nodes.len() - self.cursor
    }

    /// Number of chunks ever appended
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bytes ever appended, extracted or not
    pub fn appended_bytes(&self) -> usize {
        self.appended_bytes
    }
}
