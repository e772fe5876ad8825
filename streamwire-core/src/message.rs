//! Application-level requests, responses and their content streams.

use crate::assembler::StreamAssembler;
use crate::error::{Result, StreamingError};
use crate::sender::PayloadBody;
use crate::stream_buffer::StreamBuffer;
use crate::transport::BoxedReader;
use bytes::Bytes;
use std::sync::Arc;
use streamwire_protocol::{RequestPayload, ResponsePayload, StreamDescription};
use uuid::Uuid;

/// An outgoing content stream.
#[derive(Debug)]
pub struct ContentStream {
    pub id: Uuid,
    pub content_type: Option<String>,
    pub body: PayloadBody,
}

impl ContentStream {
    /// Creates an in-memory stream with a fresh id.
    pub fn from_bytes(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::with_body(Some(content_type.into()), PayloadBody::Bytes(bytes.into()))
    }

    /// Creates a stream that reads exactly `length` bytes from `reader`.
    pub fn from_reader(content_type: impl Into<String>, reader: BoxedReader, length: usize) -> Self {
        Self::with_body(Some(content_type.into()), PayloadBody::Known { reader, length })
    }

    /// Creates a stream of unknown length, read until `reader` reports EOF.
    pub fn unbounded(content_type: impl Into<String>, reader: BoxedReader) -> Self {
        Self::with_body(Some(content_type.into()), PayloadBody::Unbounded(reader))
    }

    pub fn with_body(content_type: Option<String>, body: PayloadBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_type,
            body,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Describes this stream for the message body that announces it.
    pub fn description(&self) -> StreamDescription {
        StreamDescription {
            id: self.id,
            content_type: self.content_type.clone(),
            length: self.body.known_length().map(|len| len as u64),
        }
    }
}

/// An outgoing request.
#[derive(Debug, Default)]
pub struct StreamingRequest {
    pub verb: String,
    pub path: String,
    pub streams: Vec<ContentStream>,
}

impl StreamingRequest {
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
            streams: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new("PUT", path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new("DELETE", path)
    }

    pub fn with_stream(mut self, stream: ContentStream) -> Self {
        self.streams.push(stream);
        self
    }

    /// Splits into the JSON body and the streams that follow it.
    pub fn into_parts(self) -> (RequestPayload, Vec<ContentStream>) {
        let payload = RequestPayload {
            verb: self.verb,
            path: self.path,
            streams: self.streams.iter().map(ContentStream::description).collect(),
        };
        (payload, self.streams)
    }
}

/// An outgoing response.
#[derive(Debug, Default)]
pub struct StreamingResponse {
    pub status_code: u16,
    pub streams: Vec<ContentStream>,
}

impl StreamingResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            streams: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn bad_request() -> Self {
        Self::new(400)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn internal_error() -> Self {
        Self::new(500)
    }

    pub fn with_stream(mut self, stream: ContentStream) -> Self {
        self.streams.push(stream);
        self
    }

    /// Splits into the JSON body and the streams that follow it.
    pub fn into_parts(self) -> (ResponsePayload, Vec<ContentStream>) {
        let payload = ResponsePayload {
            status_code: self.status_code,
            streams: self.streams.iter().map(ContentStream::description).collect(),
        };
        (payload, self.streams)
    }
}

/// An incoming content stream. Bytes become readable as frames arrive.
#[derive(Debug, Clone)]
pub struct ReceivedStream {
    pub id: Uuid,
    pub content_type: Option<String>,
    pub length: Option<u64>,
    buffer: Arc<StreamBuffer>,
}

impl ReceivedStream {
    pub(crate) fn from_assembler(assembler: &StreamAssembler) -> Self {
        Self {
            id: assembler.id(),
            content_type: assembler.content_type(),
            length: assembler.content_length(),
            buffer: assembler.buffer(),
        }
    }

    /// Reads up to `buf.len()` bytes; 0 means end-of-stream.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        self.buffer.read(buf).await
    }

    /// Reads until end-of-stream.
    pub async fn read_to_end(&self) -> Bytes {
        self.buffer.read_to_end().await
    }

    /// Reads the whole stream as UTF-8 text.
    pub async fn read_to_string(&self) -> Result<String> {
        let bytes = self.read_to_end().await;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StreamingError::Protocol(streamwire_protocol::ProtocolError::InvalidUtf8))
    }

    /// Reads the whole stream and parses it as JSON.
    pub async fn read_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.read_to_end().await;
        Ok(streamwire_protocol::Decoder::decode_json(&bytes)?)
    }

    /// Underlying buffer, for callers that need lower-level access.
    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }
}

/// An incoming request.
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub verb: String,
    pub path: String,
    pub streams: Vec<ReceivedStream>,
}

/// An incoming response.
#[derive(Debug, Clone)]
pub struct ReceiveResponse {
    pub status_code: u16,
    pub streams: Vec<ReceivedStream>,
}

impl ReceiveResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parts_describe_streams() {
        let json = ContentStream::from_bytes("application/json", &b"{\"a\":1}"[..]);
        let json_id = json.id;
        let reader: BoxedReader = Box::new(std::io::Cursor::new(vec![0u8; 4]));
        let tail = ContentStream::unbounded("text/plain", reader);

        let (payload, streams) = StreamingRequest::post("/api/messages")
            .with_stream(json)
            .with_stream(tail)
            .into_parts();

        assert_eq!(payload.verb, "POST");
        assert_eq!(payload.streams.len(), 2);
        assert_eq!(payload.streams[0].id, json_id);
        assert_eq!(payload.streams[0].length, Some(7));
        assert_eq!(payload.streams[0].content_type.as_deref(), Some("application/json"));
        assert_eq!(payload.streams[1].length, None);
        assert_eq!(streams.len(), 2);
    }

    #[test]
    fn test_response_parts() {
        let (payload, streams) = StreamingResponse::not_found().into_parts();
        assert_eq!(payload.status_code, 404);
        assert!(payload.streams.is_empty());
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn test_received_stream_reads_assembler() {
        let assembler = StreamAssembler::new(Uuid::new_v4());
        assembler.set_content_type(Some("text/plain".to_string()));
        assembler.set_content_length(Some(5));
        assembler.buffer().write(Bytes::from_static(b"hello"));

        let stream = ReceivedStream::from_assembler(&assembler);
        assert_eq!(stream.length, Some(5));
        assert_eq!(stream.read_to_string().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_received_stream_json() {
        let assembler = StreamAssembler::new(Uuid::new_v4());
        assembler.buffer().write(Bytes::from_static(br#"{"text":"hi"}"#));
        assembler.close();

        let stream = ReceivedStream::from_assembler(&assembler);
        let value: serde_json::Value = stream.read_json().await.unwrap();
        assert_eq!(value["text"], "hi");
    }
}
