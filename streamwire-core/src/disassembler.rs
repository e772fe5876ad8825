//! Send operations: break requests and responses into frames.
//!
//! A message goes out as one frame carrying its JSON body, followed by the
//! frames of each content stream it announces. The message frame is always
//! queued first and the streams are handed to the sender right after it.
//! Streams longer than one frame then interleave with everything else on the
//! connection; the operation completes once every one of them has ended.

use crate::error::{Result, StreamingError};
use crate::message::{ContentStream, StreamingRequest, StreamingResponse};
use crate::sender::{wait_sent, PayloadBody, PayloadSender};
use bytes::Bytes;
use futures::future::try_join_all;
use std::sync::Arc;
use streamwire_protocol::{Encoder, Header, PayloadType};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Disassembles outgoing messages onto a [`PayloadSender`].
#[derive(Clone)]
pub struct SendOperations {
    sender: Arc<PayloadSender>,
}

impl SendOperations {
    pub fn new(sender: Arc<PayloadSender>) -> Self {
        Self { sender }
    }

    /// Sends a request and its content streams.
    ///
    /// Cancelling `cancel` stops waiting; frames already queued are still
    /// written.
    pub async fn send_request(
        &self,
        id: Uuid,
        request: StreamingRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (payload, streams) = request.into_parts();
        let body = Encoder::encode_request(&payload)?;
        self.send_message(PayloadType::Request, id, body, streams, cancel)
            .await
    }

    /// Sends a response and its content streams.
    pub async fn send_response(
        &self,
        id: Uuid,
        response: StreamingResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (payload, streams) = response.into_parts();
        let body = Encoder::encode_response(&payload)?;
        self.send_message(PayloadType::Response, id, body, streams, cancel)
            .await
    }

    /// Tells the peer to cancel every stream of the connection and stops
    /// every stream still being sent to it.
    pub async fn send_cancel_all(&self, id: Uuid) -> Result<()> {
        let sent = self
            .sender
            .enqueue(Header::new(PayloadType::CancelAll, id), PayloadBody::Empty)?;
        let stopped = self.sender.cancel_all_streams();
        if stopped > 0 {
            tracing::debug!(stopped, "outgoing streams cancelled");
        }
        wait_sent(sent).await?;
        Ok(())
    }

    /// Tells the peer to cancel the stream `id`. If `id` is a stream still
    /// being sent from this side, sending it stops too.
    pub async fn send_cancel_stream(&self, id: Uuid) -> Result<()> {
        let sent = self
            .sender
            .enqueue(Header::new(PayloadType::CancelStream, id), PayloadBody::Empty)?;
        if self.sender.cancel_stream(&id) {
            tracing::debug!(stream = %id, "outgoing stream cancelled");
        }
        wait_sent(sent).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        payload_type: PayloadType,
        id: Uuid,
        body: Bytes,
        streams: Vec<ContentStream>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let header = Header::new(payload_type, id)
            .with_length(body.len())
            .with_end(true);

        let mut sent = Vec::with_capacity(streams.len() + 1);
        sent.push(self.sender.enqueue(header, PayloadBody::Bytes(body))?);
        for stream in streams {
            let header = Header::new(PayloadType::Stream, stream.id);
            sent.push(self.sender.enqueue(header, stream.body)?);
        }
        tracing::debug!(
            payload_type = %payload_type,
            id = %id,
            streams = sent.len() - 1,
            "message queued"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamingError::Cancelled),
            result = try_join_all(sent.into_iter().map(wait_sent)) => result.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::transport::{split, BoxedReader, Transport};
    use std::collections::HashMap;
    use streamwire_protocol::{Decoder, MAX_HEADER_LENGTH};
    use tokio::io::{AsyncRead, AsyncReadExt};

    async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> (Header, Vec<u8>) {
        let mut raw = [0u8; MAX_HEADER_LENGTH];
        reader.read_exact(&mut raw).await.unwrap();
        let header = Header::decode(&raw).unwrap();
        let mut body = vec![0u8; header.payload_length];
        reader.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    async fn operations() -> (SendOperations, BoxedReader) {
        let (near, far) = Transport::memory_pair(64 * 1024);
        let (_near_read, near_write) = split(near);
        let (far_read, _far_write) = split(far);
        let sender = Arc::new(PayloadSender::new(&SessionConfig::default()));
        sender.connect(near_write).await.unwrap();
        (SendOperations::new(sender), far_read)
    }

    #[tokio::test]
    async fn test_request_with_two_streams() {
        let (ops, mut peer) = operations().await;
        let id = Uuid::new_v4();
        let json = b"{\"text\":\"hithere\"}".to_vec();
        let text = b"some plain text here: 24".to_vec();
        assert_eq!((json.len(), text.len()), (18, 24));

        let request = StreamingRequest::post("/api/messages")
            .with_stream(ContentStream::from_bytes("json", json.clone()))
            .with_stream(ContentStream::from_bytes("text", text.clone()));
        ops.send_request(id, request, &CancellationToken::new())
            .await
            .unwrap();

        let (header, body) = read_frame(&mut peer).await;
        assert_eq!(header.payload_type, PayloadType::Request);
        assert_eq!(header.id, id);
        assert!(header.end);
        let payload = Decoder::decode_request(&body).unwrap();
        assert_eq!(payload.path, "/api/messages");
        assert_eq!(payload.streams.len(), 2);

        let mut bodies = HashMap::new();
        for _ in 0..2 {
            let (header, body) = read_frame(&mut peer).await;
            assert_eq!(header.payload_type, PayloadType::Stream);
            assert!(header.end);
            bodies.insert(header.id, body);
        }
        assert_eq!(bodies[&payload.streams[0].id], json);
        assert_eq!(bodies[&payload.streams[1].id], text);
        assert_eq!(payload.streams[0].content_type.as_deref(), Some("json"));
        assert_eq!(payload.streams[1].length, Some(24));
    }

    #[tokio::test]
    async fn test_response_without_streams() {
        let (ops, mut peer) = operations().await;
        let id = Uuid::new_v4();
        ops.send_response(id, StreamingResponse::ok(), &CancellationToken::new())
            .await
            .unwrap();

        let (header, body) = read_frame(&mut peer).await;
        assert_eq!(header.payload_type, PayloadType::Response);
        assert_eq!(header.payload_length, body.len());
        assert_eq!(Decoder::decode_response(&body).unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn test_cancel_frames() {
        let (ops, mut peer) = operations().await;
        let stream_id = Uuid::new_v4();
        ops.send_cancel_stream(stream_id).await.unwrap();
        ops.send_cancel_all(stream_id).await.unwrap();

        let (first, body) = read_frame(&mut peer).await;
        assert_eq!(first.payload_type, PayloadType::CancelStream);
        assert_eq!(first.id, stream_id);
        assert!(body.is_empty());

        let (second, _) = read_frame(&mut peer).await;
        assert_eq!(second.payload_type, PayloadType::CancelAll);
        assert_eq!(second.payload_length, 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let (ops, _peer) = operations().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ops
            .send_request(Uuid::new_v4(), StreamingRequest::get("/"), &cancel)
            .await;
        assert!(matches!(result, Err(StreamingError::Cancelled)));
    }
}
