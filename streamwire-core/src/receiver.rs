//! Payload receiver.
//!
//! Runs the receive loop: read a header, resolve where its body goes, copy
//! the body there, then report the frame. Any failure ends the loop and
//! disconnects the receiver exactly once.

use crate::error::{Result, StreamingError};
use crate::sender::DisconnectedEvent;
use crate::stream_buffer::StreamBuffer;
use crate::transport::BoxedReader;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use streamwire_protocol::{Header, PayloadType, MAX_HEADER_LENGTH, MAX_PAYLOAD_LENGTH};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consumer of received frames.
pub trait ReceiveHandler: Send + Sync + 'static {
    /// Returns the sink a frame's body is copied into, or `None` to discard
    /// the body.
    fn resolve_sink(&self, header: &Header) -> Option<Arc<StreamBuffer>>;

    /// Called once the frame's body has been fully delivered.
    fn on_receive(&self, header: &Header, sink: Option<&Arc<StreamBuffer>>, length: usize);
}

struct ReceiverShared {
    handler: RwLock<Option<Arc<dyn ReceiveHandler>>>,
    connected: AtomicBool,
    cancel: Mutex<CancellationToken>,
    events: broadcast::Sender<DisconnectedEvent>,
}

impl ReceiverShared {
    fn disconnect(&self, reason: String) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.cancel.lock().cancel();
        tracing::info!(reason = %reason, "payload receiver disconnected");
        let _ = self.events.send(DisconnectedEvent { reason });
    }
}

/// Reads frames from the transport and hands them to the subscribed handler.
pub struct PayloadReceiver {
    shared: Arc<ReceiverShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PayloadReceiver {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(ReceiverShared {
                handler: RwLock::new(None),
                connected: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    /// Registers the frame handler. Frames received with no handler are
    /// read and dropped.
    pub fn subscribe(&self, handler: Arc<dyn ReceiveHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    pub fn subscribe_disconnected(&self) -> broadcast::Receiver<DisconnectedEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Binds the reader and starts the receive loop.
    pub fn connect(&self, reader: BoxedReader) -> Result<()> {
        if self.shared.connected.swap(true, Ordering::AcqRel) {
            return Err(StreamingError::AlreadyConnected);
        }

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();

        let shared = self.shared.clone();
        let handle = tokio::spawn(receive_loop(shared, reader, cancel));
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!("payload receiver connected");
        Ok(())
    }

    /// Stops the receive loop. Only the first call has an effect.
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.shared.disconnect(reason.into());
    }

    /// Disconnects and waits for the receive loop to finish.
    pub async fn close(&self) {
        self.disconnect("receiver closed");
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PayloadReceiver {
    fn drop(&mut self) {
        self.shared.cancel.lock().cancel();
    }
}

async fn receive_loop(shared: Arc<ReceiverShared>, mut reader: BoxedReader, cancel: CancellationToken) {
    tracing::debug!("receive loop started");
    let reason = tokio::select! {
        biased;
        _ = cancel.cancelled() => "receive loop cancelled".to_string(),
        result = read_frames(&shared, &mut reader) => match result {
            Ok(()) => "transport closed".to_string(),
            Err(e) => {
                tracing::debug!(error = %e, "receive loop failed");
                e.to_string()
            }
        },
    };
    shared.disconnect(reason);
    tracing::debug!("receive loop stopped");
}

async fn read_frames(shared: &ReceiverShared, reader: &mut BoxedReader) -> Result<()> {
    let mut raw = [0u8; MAX_HEADER_LENGTH];
    loop {
        read_exact(reader, &mut raw).await?;
        let header = Header::decode(&raw)?;
        tracing::debug!(
            payload_type = %header.payload_type,
            id = %header.id,
            length = header.payload_length,
            end = header.end,
            "frame received"
        );

        let handler = shared.handler.read().clone();
        let sink = handler.as_ref().and_then(|h| h.resolve_sink(&header));

        let length = header.payload_length;
        if length > 0 {
            if header.payload_type == PayloadType::Stream {
                let body = read_body(reader, length).await?;
                deliver(sink.as_ref(), &header, body);
            } else {
                let mut remaining = length;
                while remaining > 0 {
                    let mut chunk = BytesMut::zeroed(remaining.min(MAX_PAYLOAD_LENGTH));
                    read_exact(reader, &mut chunk).await?;
                    remaining -= chunk.len();
                    deliver(sink.as_ref(), &header, chunk.freeze());
                }
            }
        }

        match handler {
            Some(handler) => handler.on_receive(&header, sink.as_ref(), length),
            None => tracing::warn!(id = %header.id, "frame received with no handler, dropped"),
        }
    }
}

fn deliver(sink: Option<&Arc<StreamBuffer>>, header: &Header, bytes: Bytes) {
    if let Some(sink) = sink {
        if !sink.write(bytes) {
            tracing::debug!(id = %header.id, "sink already closed, frame body dropped");
        }
    }
}

/// Reads a whole stream-frame body, moving at most `MAX_PAYLOAD_LENGTH`
/// bytes per call.
async fn read_body(reader: &mut BoxedReader, length: usize) -> Result<Bytes> {
    let mut body = BytesMut::zeroed(length);
    for chunk in body.chunks_mut(MAX_PAYLOAD_LENGTH) {
        read_exact(reader, chunk).await?;
    }
    Ok(body.freeze())
}

async fn read_exact(reader: &mut BoxedReader, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(StreamingError::Disconnected(
            "transport closed by peer".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}
