//! Reassembly state for one logical content stream.

use crate::stream_buffer::StreamBuffer;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use streamwire_protocol::Header;
use uuid::Uuid;

/// Wraps a [`StreamBuffer`] with stream-level metadata.
#[derive(Debug)]
pub struct StreamAssembler {
    id: Uuid,
    content_type: RwLock<Option<String>>,
    buffer: Arc<StreamBuffer>,
    end: AtomicBool,
    closed: AtomicBool,
}

impl StreamAssembler {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            content_type: RwLock::new(None),
            buffer: Arc::new(StreamBuffer::new()),
            end: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the sink that frames for this stream are written into.
    pub fn buffer(&self) -> Arc<StreamBuffer> {
        self.buffer.clone()
    }

    pub fn content_type(&self) -> Option<String> {
        self.content_type.read().clone()
    }

    pub fn set_content_type(&self, content_type: Option<String>) {
        *self.content_type.write() = content_type;
    }

    /// Declared total length, if announced.
    pub fn content_length(&self) -> Option<u64> {
        self.buffer.expected_length()
    }

    pub fn set_content_length(&self, length: Option<u64>) {
        self.buffer.set_expected_length(length);
    }

    /// Records a frame whose body has been delivered to the buffer.
    pub fn on_receive(&self, header: &Header, length: usize) {
        tracing::trace!(stream = %self.id, length, end = header.end, "stream frame assembled");
        if header.end {
            self.end.store(true, Ordering::Release);
            self.buffer.done_producing();
        }
    }

    /// Returns whether the terminal frame has been observed.
    pub fn is_ended(&self) -> bool {
        self.end.load(Ordering::Acquire)
    }

    /// Returns whether the stream ended and delivered its declared length.
    pub fn is_complete(&self) -> bool {
        if !self.is_ended() {
            return false;
        }
        match self.content_length() {
            Some(length) => self.buffer.produced() >= length,
            None => true,
        }
    }

    /// Terminates the stream. Pending and future reads see end-of-stream
    /// once buffered bytes are drained.
    ///
    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.buffer.done_producing();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
