//! Registry of in-flight content streams, keyed by stream id.

use crate::assembler::StreamAssembler;
use crate::stream_buffer::StreamBuffer;
use dashmap::DashMap;
use std::sync::Arc;
use streamwire_protocol::Header;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Emitted when a stream is closed before it completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCancelled {
    pub id: Uuid,
    /// Bytes received before the stream was closed.
    pub received: u64,
    /// Declared length, if one was announced.
    pub expected: Option<u64>,
    /// Whether the terminal frame had been seen.
    pub ended: bool,
}

/// Maps stream ids to their assemblers.
pub struct StreamRegistry {
    assemblers: DashMap<Uuid, Arc<StreamAssembler>>,
    cancelled: broadcast::Sender<StreamCancelled>,
}

impl StreamRegistry {
    pub fn new(event_capacity: usize) -> Self {
        let (cancelled, _) = broadcast::channel(event_capacity.max(1));
        Self {
            assemblers: DashMap::new(),
            cancelled,
        }
    }

    /// Subscribes to truncation notifications.
    pub fn subscribe_cancelled(&self) -> broadcast::Receiver<StreamCancelled> {
        self.cancelled.subscribe()
    }

    /// Returns the assembler for `id`, creating it if absent.
    ///
    /// Concurrent callers for the same id all receive the same instance.
    pub fn get_or_create_assembler(&self, id: Uuid) -> Arc<StreamAssembler> {
        self.assemblers
            .entry(id)
            .or_insert_with(|| Arc::new(StreamAssembler::new(id)))
            .value()
            .clone()
    }

    pub fn get_assembler(&self, id: &Uuid) -> Option<Arc<StreamAssembler>> {
        self.assemblers.get(id).map(|entry| entry.value().clone())
    }

    /// Resolves the sink for a stream frame.
    pub fn get_stream(&self, header: &Header) -> Arc<StreamBuffer> {
        self.get_or_create_assembler(header.id).buffer()
    }

    /// Records a delivered stream frame. Unknown ids are ignored.
    ///
    /// A frame carrying the end flag removes the stream. If it ends short of
    /// its declared length the stream is reported as truncated.
    pub fn on_receive(&self, header: &Header, length: usize) {
        let Some(assembler) = self.get_assembler(&header.id) else {
            tracing::debug!(stream = %header.id, "frame for unknown stream ignored");
            return;
        };
        assembler.on_receive(header, length);
        if header.end {
            self.assemblers
                .remove_if(&header.id, |_, current| Arc::ptr_eq(current, &assembler));
            if assembler.is_complete() {
                tracing::debug!(stream = %header.id, received = assembler.buffer().produced(), "stream completed");
            } else {
                self.finish(&assembler);
            }
        }
    }

    /// Removes and closes the stream with `id`.
    ///
    /// Returns false if no such stream was registered. A stream that had not
    /// completed is reported on the cancellation channel.
    pub fn close_stream(&self, id: &Uuid) -> bool {
        let Some((_, assembler)) = self.assemblers.remove(id) else {
            return false;
        };
        self.finish(&assembler);
        true
    }

    /// Closes `assembler`, reporting it once if it never completed.
    fn finish(&self, assembler: &StreamAssembler) {
        let complete = assembler.is_complete();
        if assembler.close() && !complete {
            let buffer = assembler.buffer();
            let event = StreamCancelled {
                id: assembler.id(),
                received: buffer.produced(),
                expected: buffer.expected_length(),
                ended: assembler.is_ended(),
            };
            tracing::debug!(
                stream = %event.id,
                received = event.received,
                expected = ?event.expected,
                ended = event.ended,
                "stream closed before completion"
            );
            let _ = self.cancelled.send(event);
        }
    }

    /// Closes every registered stream.
    pub fn close_all(&self) -> usize {
        let ids: Vec<Uuid> = self.assemblers.iter().map(|entry| *entry.key()).collect();
        ids.iter().filter(|id| self.close_stream(id)).count()
    }

    pub fn len(&self) -> usize {
        self.assemblers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use streamwire_protocol::PayloadType;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_or_create_race_has_single_winner() {
        let registry = Arc::new(StreamRegistry::new(8));
        let id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create_assembler(id)
            }));
        }

        let mut assemblers = Vec::new();
        for handle in handles {
            assemblers.push(handle.await.unwrap());
        }
        assert!(assemblers.iter().all(|a| Arc::ptr_eq(a, &assemblers[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_end_frame_removes_stream() {
        let registry = StreamRegistry::new(8);
        let id = Uuid::new_v4();
        let header = Header::new(PayloadType::Stream, id)
            .with_length(3)
            .with_end(true);

        let sink = registry.get_stream(&header);
        sink.write(Bytes::from_static(b"abc"));
        registry.on_receive(&header, 3);

        assert!(registry.is_empty());
        assert!(sink.is_producer_done());
    }

    #[test]
    fn test_end_before_declared_length_is_truncated() {
        let registry = StreamRegistry::new(8);
        let mut events = registry.subscribe_cancelled();
        let id = Uuid::new_v4();

        let assembler = registry.get_or_create_assembler(id);
        assembler.set_content_length(Some(10));
        let header = Header::new(PayloadType::Stream, id)
            .with_length(4)
            .with_end(true);
        registry.get_stream(&header).write(Bytes::from_static(b"1234"));
        registry.on_receive(&header, 4);

        assert!(registry.is_empty());
        assert!(assembler.is_closed());
        assert_eq!(
            events.try_recv().unwrap(),
            StreamCancelled {
                id,
                received: 4,
                expected: Some(10),
                ended: true,
            }
        );
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_on_receive_unknown_is_noop() {
        let registry = StreamRegistry::new(8);
        let header = Header::new(PayloadType::Stream, Uuid::new_v4()).with_end(true);
        registry.on_receive(&header, 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_incomplete_stream_notifies_once() {
        let registry = StreamRegistry::new(8);
        let mut events = registry.subscribe_cancelled();
        let id = Uuid::new_v4();

        let assembler = registry.get_or_create_assembler(id);
        assembler.set_content_length(Some(10));
        assembler.buffer().write(Bytes::from_static(b"1234"));

        assert!(registry.close_stream(&id));
        assert!(!registry.close_stream(&id));

        let event = events.try_recv().unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.received, 4);
        assert_eq!(event.expected, Some(10));
        assert!(!event.ended);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_close_complete_stream_is_silent() {
        let registry = StreamRegistry::new(8);
        let mut events = registry.subscribe_cancelled();
        let id = Uuid::new_v4();

        let assembler = registry.get_or_create_assembler(id);
        assembler.set_content_length(Some(2));
        assembler.buffer().write(Bytes::from_static(b"ok"));
        assembler.on_receive(&Header::new(PayloadType::Stream, id).with_end(true), 2);

        assert!(registry.close_stream(&id));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_close_all() {
        let registry = StreamRegistry::new(8);
        let mut events = registry.subscribe_cancelled();
        for _ in 0..3 {
            registry.get_or_create_assembler(Uuid::new_v4());
        }

        assert_eq!(registry.close_all(), 3);
        assert!(registry.is_empty());
        for _ in 0..3 {
            assert!(events.try_recv().is_ok());
        }
    }
}
