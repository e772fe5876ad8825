//! Producer/consumer byte buffer for one logical stream.
//!
//! The receive loop appends chunks as frames arrive; a consumer reads them
//! back in order and suspends while no chunk is available. Chunks keep their
//! own backing storage, nothing is copied on the way in.

use crate::error::{Result, StreamingError};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct BufferState {
    chunks: VecDeque<Bytes>,
    produced: u64,
    consumed: u64,
    expected_length: Option<u64>,
    producer_done: bool,
}

impl BufferState {
    fn remaining_allowed(&self) -> Option<u64> {
        self.expected_length
            .map(|len| len.saturating_sub(self.consumed))
    }

    fn at_end(&self) -> bool {
        if self.remaining_allowed() == Some(0) {
            return true;
        }
        self.chunks.is_empty() && self.producer_done
    }
}

/// Byte queue backing a single logical stream.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer that reports end-of-stream after `length` bytes.
    pub fn with_expected_length(length: u64) -> Self {
        let buffer = Self::new();
        buffer.set_expected_length(Some(length));
        buffer
    }

    /// Appends a chunk. Returns false if production already ended.
    pub fn write(&self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return !self.state.lock().producer_done;
        }
        {
            let mut state = self.state.lock();
            if state.producer_done {
                return false;
            }
            state.produced += chunk.len() as u64;
            state.chunks.push_back(chunk);
        }
        self.notify.notify_waiters();
        true
    }

    /// Signals that no more chunks will be written.
    pub fn done_producing(&self) {
        self.state.lock().producer_done = true;
        self.notify.notify_waiters();
    }

    /// Sets (or clears) the declared total length of the stream.
    pub fn set_expected_length(&self, length: Option<u64>) {
        self.state.lock().expected_length = length;
        self.notify.notify_waiters();
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.state.lock().expected_length
    }

    /// Total bytes written so far.
    pub fn produced(&self) -> u64 {
        self.state.lock().produced
    }

    /// Total bytes read so far.
    pub fn consumed(&self) -> u64 {
        self.state.lock().consumed
    }

    /// Returns whether production has ended.
    pub fn is_producer_done(&self) -> bool {
        self.state.lock().producer_done
    }

    /// Returns whether a reader would see end-of-stream right now.
    pub fn is_finished(&self) -> bool {
        self.state.lock().at_end()
    }

    /// Copies buffered bytes into `buf` without waiting.
    ///
    /// Returns `None` when nothing is available yet and the stream has not
    /// ended, `Some(0)` at end-of-stream.
    fn try_read(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return Some(0);
        }

        let mut state = self.state.lock();
        if state.at_end() {
            return Some(0);
        }

        let mut limit = buf.len();
        if let Some(allowed) = state.remaining_allowed() {
            limit = limit.min(allowed.min(usize::MAX as u64) as usize);
        }

        let mut copied = 0;
        while copied < limit {
            let Some(chunk) = state.chunks.front_mut() else {
                break;
            };
            let n = chunk.len().min(limit - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            chunk.advance(n);
            copied += n;
            if chunk.is_empty() {
                state.chunks.pop_front();
            }
        }

        if copied == 0 {
            return None;
        }
        state.consumed += copied as u64;
        Some(copied)
    }

    /// Reads up to `buf.len()` bytes, waiting until at least one byte is
    /// available or the stream ends. Returns 0 at end-of-stream.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(n) = self.try_read(buf) {
                return n;
            }
            notified.await;
        }
    }

    /// Like [`read`](Self::read), but gives up when `cancel` fires.
    ///
    /// Cancellation only abandons this wait; buffered data stays in place.
    pub async fn read_with_cancel(
        &self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamingError::Cancelled),
            n = self.read(buf) => Ok(n),
        }
    }

    /// Reads until end-of-stream.
    pub async fn read_to_end(&self) -> Bytes {
        let mut out = BytesMut::new();
        let mut chunk = vec![0u8; streamwire_protocol::MAX_PAYLOAD_LENGTH];
        loop {
            let n = self.read(&mut chunk).await;
            if n == 0 {
                return out.freeze();
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Drains whatever is buffered right now without waiting.
    pub fn take_buffered(&self) -> Bytes {
        let mut state = self.state.lock();
        let mut out = BytesMut::new();
        let mut allowed = state.remaining_allowed().unwrap_or(u64::MAX);
        while allowed > 0 {
            let Some(mut chunk) = state.chunks.pop_front() else {
                break;
            };
            if chunk.len() as u64 > allowed {
                chunk.truncate(allowed as usize);
            }
            allowed -= chunk.len() as u64;
            state.consumed += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_can_read_less() {
        let buffer = StreamBuffer::new();
        buffer.write(Bytes::from(vec![7u8; 100]));

        let mut out = [0u8; 50];
        assert_eq!(buffer.read(&mut out).await, 50);
        assert_eq!(buffer.consumed(), 50);
        assert_eq!(buffer.produced(), 100);
    }

    #[tokio::test]
    async fn test_can_read_more_get_less() {
        let buffer = StreamBuffer::new();
        let data: Vec<u8> = (0..100u8).collect();
        buffer.write(Bytes::from(data.clone()));

        let mut out = [0u8; 200];
        let n = buffer.read(&mut out).await;
        assert_eq!(n, 100);
        assert_eq!(&out[..n], &data[..]);
    }

    #[test]
    fn test_pending_read_woken_by_write() {
        let buffer = StreamBuffer::new();
        let mut out = [0u8; 8];
        let mut read = tokio_test::task::spawn(buffer.read(&mut out));

        tokio_test::assert_pending!(read.poll());
        buffer.write(Bytes::from_static(b"abc"));
        assert!(read.is_woken());
        tokio_test::assert_ready_eq!(read.poll(), 3);
    }

    #[tokio::test]
    async fn test_read_spans_chunks() {
        let buffer = StreamBuffer::new();
        buffer.write(Bytes::from_static(b"abc"));
        buffer.write(Bytes::from_static(b"def"));
        buffer.done_producing();

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out).await, 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(buffer.read(&mut out).await, 2);
        assert_eq!(&out[..2], b"ef");
        assert_eq!(buffer.read(&mut out).await, 0);
        // Reading past the end keeps returning EOF.
        assert_eq!(buffer.read(&mut out).await, 0);
    }

    #[tokio::test]
    async fn test_expected_length_caps_reads() {
        let buffer = StreamBuffer::with_expected_length(5);
        buffer.write(Bytes::from_static(b"0123456789"));

        let bytes = buffer.read_to_end().await;
        assert_eq!(&bytes[..], b"01234");
        assert!(buffer.is_finished());
    }

    #[tokio::test]
    async fn test_write_after_done_is_rejected() {
        let buffer = StreamBuffer::new();
        buffer.done_producing();
        assert!(!buffer.write(Bytes::from_static(b"late")));
        assert_eq!(buffer.produced(), 0);
    }

    #[tokio::test]
    async fn test_reader_waits_for_producer() {
        let buffer = Arc::new(StreamBuffer::new());
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.read_to_end().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.write(Bytes::from_static(b"hello "));
        tokio::task::yield_now().await;
        buffer.write(Bytes::from_static(b"world"));
        buffer.done_producing();

        let bytes = reader.await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn test_done_wakes_blocked_reader() {
        let buffer = Arc::new(StreamBuffer::new());
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut out = [0u8; 16];
                buffer.read(&mut out).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.done_producing();

        let n = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_read_cancelled() {
        let buffer = StreamBuffer::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut out = [0u8; 8];
        let result = buffer.read_with_cancel(&mut out, &cancel).await;
        assert!(matches!(result, Err(StreamingError::Cancelled)));
    }

    #[tokio::test]
    async fn test_take_buffered() {
        let buffer = StreamBuffer::with_expected_length(4);
        buffer.write(Bytes::from_static(b"ab"));
        buffer.write(Bytes::from_static(b"cdef"));

        assert_eq!(&buffer.take_buffered()[..], b"abcd");
        assert_eq!(buffer.consumed(), 4);
        assert!(buffer.is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_producer_consumer_multithreaded() {
        for (produce_chunk, consume_chunk) in [(100, 50), (50, 100), (1, 50), (100, 1)] {
            let buffer = Arc::new(StreamBuffer::new());
            let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

            let producer = {
                let buffer = buffer.clone();
                let data = data.clone();
                tokio::spawn(async move {
                    for chunk in data.chunks(produce_chunk) {
                        buffer.write(Bytes::copy_from_slice(chunk));
                        tokio::task::yield_now().await;
                    }
                    buffer.done_producing();
                })
            };

            let consumer = {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    let mut out = Vec::new();
                    let mut chunk = vec![0u8; consume_chunk];
                    loop {
                        let n = buffer.read(&mut chunk).await;
                        if n == 0 {
                            break;
                        }
                        out.extend_from_slice(&chunk[..n]);
                    }
                    out
                })
            };

            producer.await.unwrap();
            let received = consumer.await.unwrap();
            assert_eq!(received, data);
        }
    }
}
