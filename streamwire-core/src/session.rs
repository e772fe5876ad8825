//! Streaming session.
//!
//! A session runs the protocol over one duplex transport. It owns the
//! sender, the receiver, the stream registry and the correlation table, and
//! dispatches every incoming frame by type:
//!
//! | Type | Action |
//! |------|--------|
//! | `A`  | decode request, hand it to the [`RequestHandler`], send the response back |
//! | `B`  | decode response, resolve the pending request with the same id |
//! | `S`  | append bytes to the stream's assembler |
//! | `C`  | close the named stream |
//! | `X`  | close every open stream |
//!
//! The first disconnect from either half tears the whole session down.

use crate::config::SessionConfig;
use crate::correlation::CorrelationTable;
use crate::disassembler::SendOperations;
use crate::error::{Result, StreamingError};
use crate::message::{
    ReceiveRequest, ReceiveResponse, ReceivedStream, StreamingRequest, StreamingResponse,
};
use crate::receiver::{PayloadReceiver, ReceiveHandler};
use crate::registry::{StreamCancelled, StreamRegistry};
use crate::sender::PayloadSender;
use crate::stream_buffer::StreamBuffer;
use crate::transport::split;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use streamwire_protocol::{Decoder, Header, PayloadType, StreamDescription};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Application handler for incoming requests.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: ReceiveRequest) -> BoxFuture<'static, StreamingResponse>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(ReceiveRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StreamingResponse> + Send + 'static,
{
    fn handle(&self, request: ReceiveRequest) -> BoxFuture<'static, StreamingResponse> {
        Box::pin(self(request))
    }
}

/// Emitted once when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDisconnected {
    pub reason: String,
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn RequestHandler>>>>;

/// Routes received frames. Holds no reference back to the receiver.
struct Dispatcher {
    sender: Arc<PayloadSender>,
    registry: Arc<StreamRegistry>,
    correlation: Arc<CorrelationTable<ReceiveResponse>>,
    operations: SendOperations,
    handler: HandlerSlot,
}

impl Dispatcher {
    fn received_streams(&self, descriptions: Vec<StreamDescription>) -> Vec<ReceivedStream> {
        descriptions
            .into_iter()
            .map(|description| {
                let assembler = self.registry.get_or_create_assembler(description.id);
                assembler.set_content_type(description.content_type);
                if description.length.is_some() {
                    assembler.set_content_length(description.length);
                }
                ReceivedStream::from_assembler(&assembler)
            })
            .collect()
    }

    fn on_request(&self, header: &Header, body: &[u8]) {
        let payload = match Decoder::decode_request(body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(id = %header.id, error = %e, "undecodable request, answering 400");
                self.respond(header.id, StreamingResponse::bad_request());
                return;
            }
        };

        let request = ReceiveRequest {
            verb: payload.verb,
            path: payload.path,
            streams: self.received_streams(payload.streams),
        };
        tracing::debug!(id = %header.id, verb = %request.verb, path = %request.path, "request received");

        let handler = self.handler.read().clone();
        let operations = self.operations.clone();
        let id = header.id;
        tokio::spawn(async move {
            let response = match handler {
                Some(handler) => handler.handle(request).await,
                None => {
                    tracing::warn!(id = %id, "no request handler subscribed");
                    StreamingResponse::not_found()
                }
            };
            send_response(operations, id, response).await;
        });
    }

    fn respond(&self, id: Uuid, response: StreamingResponse) {
        tokio::spawn(send_response(self.operations.clone(), id, response));
    }

    fn on_response(&self, header: &Header, body: &[u8]) {
        let payload = match Decoder::decode_response(body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(id = %header.id, error = %e, "undecodable response dropped");
                return;
            }
        };

        let response = ReceiveResponse {
            status_code: payload.status_code,
            streams: self.received_streams(payload.streams),
        };
        if !self.correlation.signal(&header.id, Some(response)) {
            tracing::debug!(id = %header.id, "no pending request for response");
        }
    }
}

async fn send_response(operations: SendOperations, id: Uuid, response: StreamingResponse) {
    if let Err(e) = operations
        .send_response(id, response, &CancellationToken::new())
        .await
    {
        tracing::warn!(id = %id, error = %e, "failed to send response");
    }
}

impl ReceiveHandler for Dispatcher {
    fn resolve_sink(&self, header: &Header) -> Option<Arc<StreamBuffer>> {
        match header.payload_type {
            PayloadType::Request | PayloadType::Response => Some(Arc::new(
                StreamBuffer::with_expected_length(header.payload_length as u64),
            )),
            PayloadType::Stream => Some(self.registry.get_stream(header)),
            PayloadType::CancelAll | PayloadType::CancelStream => None,
        }
    }

    fn on_receive(&self, header: &Header, sink: Option<&Arc<StreamBuffer>>, length: usize) {
        match header.payload_type {
            PayloadType::Request | PayloadType::Response => {
                let body = sink.map(|sink| sink.take_buffered()).unwrap_or_default();
                if header.payload_type == PayloadType::Request {
                    self.on_request(header, &body);
                } else {
                    self.on_response(header, &body);
                }
            }
            PayloadType::Stream => self.registry.on_receive(header, length),
            PayloadType::CancelStream => {
                let incoming = self.registry.close_stream(&header.id);
                let outgoing = self.sender.cancel_stream(&header.id);
                if !incoming && !outgoing {
                    tracing::debug!(stream = %header.id, "cancel for unknown stream");
                }
            }
            PayloadType::CancelAll => {
                let closed = self.registry.close_all();
                let stopped = self.sender.cancel_all_streams();
                tracing::debug!(closed, stopped, "all streams cancelled by peer");
            }
        }
    }
}

struct SessionInner {
    config: SessionConfig,
    sender: Arc<PayloadSender>,
    receiver: PayloadReceiver,
    registry: Arc<StreamRegistry>,
    correlation: Arc<CorrelationTable<ReceiveResponse>>,
    operations: SendOperations,
    handler: HandlerSlot,
    events: broadcast::Sender<SessionDisconnected>,
    connected: AtomicBool,
    torn_down: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    async fn teardown(&self, reason: String) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.shutdown(reason.clone()).await;
        self.receiver.disconnect(reason.clone());
        self.correlation.fail_all(&reason);
        self.registry.close_all();
        tracing::info!(reason = %reason, "session disconnected");
        let _ = self.events.send(SessionDisconnected { reason });
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
        self.receiver.disconnect("session dropped");
    }
}

/// One protocol session over a duplex transport.
pub struct StreamingSession {
    inner: Arc<SessionInner>,
}

impl StreamingSession {
    /// Creates an unconnected session. Must be called within a tokio runtime.
    pub fn new(config: SessionConfig) -> Self {
        let sender = Arc::new(PayloadSender::new(&config));
        let receiver = PayloadReceiver::new(config.event_capacity);
        let registry = Arc::new(StreamRegistry::new(config.event_capacity));
        let correlation = Arc::new(CorrelationTable::new());
        let operations = SendOperations::new(sender.clone());
        let handler: HandlerSlot = Arc::new(RwLock::new(None));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        receiver.subscribe(Arc::new(Dispatcher {
            sender: sender.clone(),
            registry: registry.clone(),
            correlation: correlation.clone(),
            operations: operations.clone(),
            handler: handler.clone(),
        }));

        Self {
            inner: Arc::new(SessionInner {
                config,
                sender,
                receiver,
                registry,
                correlation,
                operations,
                handler,
                events,
                connected: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Binds the session to `transport` and starts receiving.
    ///
    /// A session serves a single connection; connecting twice fails.
    pub async fn connect<T>(&self, transport: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return Err(StreamingError::Disconnected("session closed".to_string()));
        }
        if self.inner.connected.swap(true, Ordering::AcqRel) {
            return Err(StreamingError::AlreadyConnected);
        }

        let (reader, writer) = split(transport);
        let mut sender_events = self.inner.sender.subscribe_disconnected();
        let mut receiver_events = self.inner.receiver.subscribe_disconnected();

        self.inner.sender.connect(writer).await?;
        self.inner.receiver.connect(reader)?;

        let weak = Arc::downgrade(&self.inner);
        let supervisor = tokio::spawn(async move {
            let reason = tokio::select! {
                event = sender_events.recv() => match event {
                    Ok(event) => event.reason,
                    Err(_) => "sender dropped".to_string(),
                },
                event = receiver_events.recv() => match event {
                    Ok(event) => event.reason,
                    Err(_) => "receiver dropped".to_string(),
                },
            };
            if let Some(inner) = weak.upgrade() {
                inner.teardown(reason).await;
            }
        });
        *self.inner.supervisor.lock() = Some(supervisor);

        tracing::info!("session connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire) && !self.inner.torn_down.load(Ordering::Acquire)
    }

    /// Registers the handler for incoming requests, replacing any previous one.
    pub fn subscribe<H: RequestHandler>(&self, handler: H) {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Yields exactly one event when the session ends.
    pub fn subscribe_disconnected(&self) -> broadcast::Receiver<SessionDisconnected> {
        self.inner.events.subscribe()
    }

    /// Yields an event for each incoming stream closed before completion.
    pub fn subscribe_stream_cancelled(&self) -> broadcast::Receiver<StreamCancelled> {
        self.inner.registry.subscribe_cancelled()
    }

    pub async fn send_request(
        &self,
        id: Uuid,
        request: StreamingRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.operations.send_request(id, request, cancel).await
    }

    pub async fn send_response(
        &self,
        id: Uuid,
        response: StreamingResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner
            .operations
            .send_response(id, response, cancel)
            .await
    }

    pub async fn send_cancel_all(&self, id: Uuid) -> Result<()> {
        self.inner.operations.send_cancel_all(id).await
    }

    pub async fn send_cancel_stream(&self, id: Uuid) -> Result<()> {
        self.inner.operations.send_cancel_stream(id).await
    }

    /// Waits for the response to request `id`.
    ///
    /// Returns `Ok(None)` if `id` is already being awaited, and fails with
    /// `Disconnected` once the session has been torn down.
    pub async fn await_response(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<ReceiveResponse>> {
        self.inner.correlation.await_response(id, cancel).await
    }

    /// Sends `request` under a fresh id and waits for its response, bounded
    /// by the configured request timeout.
    pub async fn request(
        &self,
        request: StreamingRequest,
        cancel: &CancellationToken,
    ) -> Result<ReceiveResponse> {
        let id = Uuid::new_v4();
        let pending = self.inner.correlation.register(id)?;

        self.send_request(id, request, cancel).await?;

        match tokio::time::timeout(self.inner.config.request_timeout(), pending.wait(cancel)).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(StreamingError::Disconnected(
                "empty response".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(id = %id, "request timed out");
                Err(StreamingError::Timeout)
            }
        }
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlation.len()
    }

    /// Number of incoming streams still being assembled.
    pub fn open_streams(&self) -> usize {
        self.inner.registry.len()
    }

    /// Flushes queued frames, then tears the session down.
    pub async fn close(&self) {
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }

        if self.inner.connected.load(Ordering::Acquire) {
            self.inner.sender.close().await;
        }
        self.inner.teardown("session closed".to_string()).await;
        self.inner.receiver.close().await;
    }
}
