//! Payload sender.
//!
//! Turns send requests into frames and writes them through the ordered send
//! queue. One queued item is exactly one frame, written whole before the next
//! one starts.
//!
//! A body that fits in a single frame is queued directly. Anything longer is
//! driven by its own pump task: it produces the next frame, posts it to the
//! back of the queue and waits until that frame is on the wire before
//! producing another. Frames of different payloads therefore interleave, and
//! an idle body never holds up frames queued behind it.

use crate::config::SessionConfig;
use crate::error::{Result, StreamingError};
use crate::send_queue::SendQueue;
use crate::transport::{BoxedReader, BoxedWriter};
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamwire_protocol::{Header, MAX_LENGTH, MAX_PAYLOAD_LENGTH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Notification that one half of a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedEvent {
    pub reason: String,
}

/// Body of an outgoing payload.
pub enum PayloadBody {
    /// No body; a single zero-length frame.
    Empty,
    /// In-memory body of known length.
    Bytes(Bytes),
    /// Reader yielding exactly `length` bytes.
    Known { reader: BoxedReader, length: usize },
    /// Reader of unknown length, sent as frames of at most
    /// `MAX_PAYLOAD_LENGTH` bytes followed by an empty terminal frame.
    Unbounded(BoxedReader),
}

impl PayloadBody {
    /// Returns the body length when known upfront.
    pub fn known_length(&self) -> Option<usize> {
        match self {
            PayloadBody::Empty => Some(0),
            PayloadBody::Bytes(bytes) => Some(bytes.len()),
            PayloadBody::Known { length, .. } => Some(*length),
            PayloadBody::Unbounded(_) => None,
        }
    }
}

impl std::fmt::Debug for PayloadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadBody::Empty => f.write_str("Empty"),
            PayloadBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            PayloadBody::Known { length, .. } => {
                f.debug_struct("Known").field("length", length).finish()
            }
            PayloadBody::Unbounded(_) => f.write_str("Unbounded"),
        }
    }
}

impl From<Bytes> for PayloadBody {
    fn from(bytes: Bytes) -> Self {
        PayloadBody::Bytes(bytes)
    }
}

/// Completion of a queued payload: the header of its last frame.
pub type SentReceiver = oneshot::Receiver<Result<Header>>;
type SentSender = oneshot::Sender<Result<Header>>;

/// One frame queued for writing.
struct Frame {
    header: Header,
    body: Bytes,
    sent: Option<SentSender>,
}

/// Remaining body of a payload that spans several frames.
enum FrameSource {
    Bytes(Bytes),
    Known {
        reader: BoxedReader,
        remaining: usize,
        length: usize,
    },
    Unbounded(BoxedReader),
}

impl FrameSource {
    /// Produces the next frame body and whether it is the last one.
    async fn next_frame(&mut self) -> Result<(Bytes, bool)> {
        match self {
            FrameSource::Bytes(bytes) => {
                let frame = bytes.split_to(bytes.len().min(MAX_LENGTH));
                Ok((frame, bytes.is_empty()))
            }
            FrameSource::Known {
                reader,
                remaining,
                length,
            } => {
                let frame_len = (*remaining).min(MAX_LENGTH);
                let mut frame = BytesMut::zeroed(frame_len);
                let mut filled = 0;
                while filled < frame_len {
                    let n = reader.read(&mut frame[filled..]).await?;
                    if n == 0 {
                        return Err(StreamingError::ShortBody {
                            expected: *length,
                            actual: *length - *remaining + filled,
                        });
                    }
                    filled += n;
                }
                *remaining -= frame_len;
                Ok((frame.freeze(), *remaining == 0))
            }
            FrameSource::Unbounded(reader) => {
                let mut chunk = BytesMut::zeroed(MAX_PAYLOAD_LENGTH);
                let n = reader.read(&mut chunk).await?;
                chunk.truncate(n);
                Ok((chunk.freeze(), n == 0))
            }
        }
    }
}

/// A running multi-frame payload.
struct Pump {
    id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SenderShared {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    connected: AtomicBool,
    /// Fired on disconnect. Aborts the frame being written and every pump.
    cancel: CancellationToken,
    events: broadcast::Sender<DisconnectedEvent>,
}

impl SenderShared {
    async fn disconnect(&self, reason: String) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        tracing::info!(reason = %reason, "payload sender disconnected");

        // An in-flight write gives up the lock as soon as `cancel` fires.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.events.send(DisconnectedEvent { reason });
    }
}

/// Writes framed payloads to the transport in post order.
pub struct PayloadSender {
    shared: Arc<SenderShared>,
    queue: Arc<SendQueue<Frame>>,
    pumps: Mutex<Vec<Pump>>,
    shutdown_timeout: Duration,
}

impl PayloadSender {
    /// Creates a disconnected sender. Must be called within a tokio runtime.
    pub fn new(config: &SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(SenderShared {
            writer: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            events,
        });

        let action_shared = shared.clone();
        let queue = Arc::new(SendQueue::new(
            "payload-sender",
            move |frame: Frame| write_frame(action_shared.clone(), frame),
            config.shutdown_timeout(),
        ));

        Self {
            shared,
            queue,
            pumps: Mutex::new(Vec::new()),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Binds the sender to a transport writer. A sender serves one
    /// connection; once disconnected it cannot be reconnected.
    pub async fn connect(&self, writer: BoxedWriter) -> Result<()> {
        let mut guard = self.shared.writer.lock().await;
        if self.shared.connected.load(Ordering::Acquire) || guard.is_some() {
            return Err(StreamingError::AlreadyConnected);
        }
        if self.shared.cancel.is_cancelled() {
            return Err(StreamingError::Disconnected("sender closed".to_string()));
        }
        *guard = Some(writer);
        self.shared.connected.store(true, Ordering::Release);
        tracing::info!("payload sender connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn subscribe_disconnected(&self) -> broadcast::Receiver<DisconnectedEvent> {
        self.shared.events.subscribe()
    }

    /// Enqueues a payload. `sent` fires with the final header once the last
    /// frame has been written, or with an error if the payload was cancelled.
    /// It is dropped if the payload never makes it.
    ///
    /// A single-frame payload takes its place in the queue immediately.
    pub fn send_payload(
        &self,
        header: Header,
        body: PayloadBody,
        sent: Option<SentSender>,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(StreamingError::NotConnected);
        }

        let source = match body {
            PayloadBody::Empty | PayloadBody::Known { length: 0, .. } => {
                return self.post(header.with_length(0).with_end(true), Bytes::new(), sent);
            }
            PayloadBody::Bytes(bytes) if bytes.len() <= MAX_LENGTH => {
                let header = header.with_length(bytes.len()).with_end(true);
                return self.post(header, bytes, sent);
            }
            PayloadBody::Bytes(bytes) => FrameSource::Bytes(bytes),
            PayloadBody::Known { reader, length } => FrameSource::Known {
                reader,
                remaining: length,
                length,
            },
            PayloadBody::Unbounded(reader) => FrameSource::Unbounded(reader),
        };
        self.spawn_pump(header, source, sent);
        Ok(())
    }

    /// Enqueues a payload and returns a receiver for its completion.
    pub fn enqueue(&self, header: Header, body: PayloadBody) -> Result<SentReceiver> {
        let (tx, rx) = oneshot::channel();
        self.send_payload(header, body, Some(tx))?;
        Ok(rx)
    }

    /// Enqueues a payload and waits until it has been written.
    pub async fn send(&self, header: Header, body: PayloadBody) -> Result<Header> {
        let rx = self.enqueue(header, body)?;
        wait_sent(rx).await
    }

    /// Number of frames waiting to be written.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Number of multi-frame payloads still being sent.
    pub fn active_streams(&self) -> usize {
        self.pumps
            .lock()
            .iter()
            .filter(|pump| !pump.handle.is_finished())
            .count()
    }

    /// Stops sending payload `id`. The peer gets an empty terminal frame
    /// for it and its completion resolves to `Cancelled`.
    ///
    /// Returns whether a payload with that id was still being sent.
    pub fn cancel_stream(&self, id: &Uuid) -> bool {
        let pumps = self.pumps.lock();
        let mut found = false;
        for pump in pumps
            .iter()
            .filter(|pump| pump.id == *id && !pump.handle.is_finished())
        {
            pump.cancel.cancel();
            found = true;
        }
        found
    }

    /// Stops every payload still being sent. Returns how many were stopped.
    pub fn cancel_all_streams(&self) -> usize {
        let pumps = self.pumps.lock();
        let mut stopped = 0;
        for pump in pumps.iter().filter(|pump| !pump.handle.is_finished()) {
            pump.cancel.cancel();
            stopped += 1;
        }
        stopped
    }

    /// Disconnects the sender. Only the first call has an effect.
    pub async fn disconnect(&self, reason: impl Into<String>) {
        self.shared.disconnect(reason.into()).await;
    }

    /// Lets running payloads finish and drains queued frames, each bounded
    /// by the shutdown timeout, then disconnects.
    pub async fn close(&self) {
        let pumps = std::mem::take(&mut *self.pumps.lock());
        if !pumps.is_empty() {
            let cancels: Vec<CancellationToken> =
                pumps.iter().map(|pump| pump.cancel.clone()).collect();
            let joined = join_all(pumps.into_iter().map(|pump| pump.handle));
            tokio::pin!(joined);
            if tokio::time::timeout(self.shutdown_timeout, joined.as_mut())
                .await
                .is_err()
            {
                tracing::warn!(
                    streams = cancels.len(),
                    "outgoing streams still open at close, cancelling"
                );
                cancels.iter().for_each(CancellationToken::cancel);
                joined.await;
            }
        }

        self.queue.close().await;
        self.disconnect("sender closed").await;
    }

    /// Disconnects without draining: aborts the frame being written, stops
    /// every payload, then waits for the queue consumer and the pumps to
    /// finish.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        self.disconnect(reason).await;
        self.shared.cancel.cancel();
        self.queue.abort().await;

        let pumps = std::mem::take(&mut *self.pumps.lock());
        for pump in pumps {
            pump.handle.abort();
            let _ = pump.handle.await;
        }
    }

    fn post(&self, header: Header, body: Bytes, sent: Option<SentSender>) -> Result<()> {
        self.queue
            .post(Frame { header, body, sent })
            .map_err(|_| StreamingError::Disconnected("send queue closed".to_string()))
    }

    fn spawn_pump(&self, header: Header, source: FrameSource, sent: Option<SentSender>) {
        let cancel = self.shared.cancel.child_token();
        let handle = tokio::spawn(pump(
            self.shared.clone(),
            self.queue.clone(),
            cancel.clone(),
            header,
            source,
            sent,
        ));

        let mut pumps = self.pumps.lock();
        pumps.retain(|pump| !pump.handle.is_finished());
        pumps.push(Pump {
            id: header.id,
            cancel,
            handle,
        });
    }
}

impl Drop for PayloadSender {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Waits on a completion receiver returned by [`PayloadSender::enqueue`].
pub async fn wait_sent(rx: SentReceiver) -> Result<Header> {
    rx.await.map_err(|_| {
        StreamingError::Disconnected("payload dropped before it was written".to_string())
    })?
}

async fn write_frame(shared: Arc<SenderShared>, frame: Frame) -> Result<()> {
    let Frame { header, body, sent } = frame;

    let result = {
        let mut guard = shared.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if shared.connected.load(Ordering::Acquire) => writer,
            _ => return Err(StreamingError::NotConnected),
        };
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(StreamingError::Disconnected(
                "sender disconnected mid-frame".to_string(),
            )),
            result = write_all_frame(writer, &header, &body) => result,
        }
    };

    match result {
        Ok(()) => {
            tracing::debug!(
                payload_type = %header.payload_type,
                id = %header.id,
                length = header.payload_length,
                end = header.end,
                "frame sent"
            );
            if let Some(sent) = sent {
                let _ = sent.send(Ok(header));
            }
            Ok(())
        }
        Err(e) => {
            shared.disconnect(format!("write failed: {}", e)).await;
            Err(e)
        }
    }
}

async fn write_all_frame(writer: &mut BoxedWriter, header: &Header, body: &[u8]) -> Result<()> {
    writer.write_all(&header.encode()?).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

async fn pump(
    shared: Arc<SenderShared>,
    queue: Arc<SendQueue<Frame>>,
    cancel: CancellationToken,
    header: Header,
    mut source: FrameSource,
    sent: Option<SentSender>,
) {
    match pump_frames(&queue, &cancel, header, &mut source).await {
        Ok(last) => {
            if let Some(sent) = sent {
                let _ = sent.send(Ok(last));
            }
        }
        Err(StreamingError::Cancelled) if !shared.cancel.is_cancelled() => {
            tracing::debug!(stream = %header.id, "outgoing stream cancelled");
            // Terminate the stream so the peer drops whatever it holds for it.
            let terminal = Frame {
                header: header.with_length(0).with_end(true),
                body: Bytes::new(),
                sent: None,
            };
            let _ = queue.post(terminal);
            if let Some(sent) = sent {
                let _ = sent.send(Err(StreamingError::Cancelled));
            }
        }
        Err(e @ (StreamingError::Io(_) | StreamingError::ShortBody { .. }))
            if !shared.cancel.is_cancelled() =>
        {
            // Frames already on the wire announced a body that cannot be
            // completed.
            tracing::warn!(stream = %header.id, error = %e, "outgoing stream body failed");
            shared
                .disconnect(format!("stream {} failed: {}", header.id, e))
                .await;
        }
        Err(e) => {
            tracing::debug!(stream = %header.id, error = %e, "outgoing stream stopped");
        }
    }
}

async fn pump_frames(
    queue: &SendQueue<Frame>,
    cancel: &CancellationToken,
    header: Header,
    source: &mut FrameSource,
) -> Result<Header> {
    loop {
        let (body, end) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamingError::Cancelled),
            next = source.next_frame() => next?,
        };

        let (tx, rx) = oneshot::channel();
        let frame = Frame {
            header: header.with_length(body.len()).with_end(end),
            body,
            sent: Some(tx),
        };
        queue
            .post(frame)
            .map_err(|_| StreamingError::Disconnected("send queue closed".to_string()))?;

        // The next frame is produced only once this one is on the wire.
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamingError::Cancelled),
            written = wait_sent(rx) => written?,
        };
        if written.end {
            return Ok(written);
        }
    }
}
