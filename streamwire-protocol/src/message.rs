//! JSON message bodies carried by request and response frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Describes one content stream announced by a request or response.
///
/// The stream's bytes follow as separate `S` frames tagged with `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescription {
    /// Identifier of the content stream.
    pub id: Uuid,

    /// Content type of the stream (e.g. `application/json`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Total length in bytes, when known upfront.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl StreamDescription {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            content_type: None,
            length: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }
}

/// Body of a request frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Request verb (e.g. `GET`, `POST`).
    #[serde(default)]
    pub verb: String,

    /// Request path.
    #[serde(default)]
    pub path: String,

    /// Content streams that follow this request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamDescription>,
}

impl RequestPayload {
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
            streams: Vec::new(),
        }
    }

    pub fn with_stream(mut self, stream: StreamDescription) -> Self {
        self.streams.push(stream);
        self
    }
}

/// Body of a response frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Status code of the response.
    pub status_code: u16,

    /// Content streams that follow this response.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamDescription>,
}

impl ResponsePayload {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            streams: Vec::new(),
        }
    }

    pub fn with_stream(mut self, stream: StreamDescription) -> Self {
        self.streams.push(stream);
        self
    }

    /// Returns whether the status code is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let id = Uuid::new_v4();
        let req = RequestPayload::new("POST", "/api/messages").with_stream(
            StreamDescription::new(id)
                .with_content_type("application/json")
                .with_length(18),
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""verb":"POST""#));
        assert!(json.contains(r#""path":"/api/messages""#));
        assert!(json.contains(r#""type":"application/json""#));
        assert!(json.contains(r#""length":18"#));
        assert!(json.contains(&id.to_string()));
    }

    #[test]
    fn test_request_without_streams() {
        let req = RequestPayload::new("GET", "/health");
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("streams"));

        let parsed: RequestPayload = serde_json::from_str(r#"{"verb":"GET","path":"/health"}"#)
            .unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_response_serialization() {
        let resp = ResponsePayload::new(200);
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"statusCode":200}"#);
        assert!(resp.is_success());
        assert!(!ResponsePayload::new(404).is_success());
    }

    #[test]
    fn test_stream_description_optional_fields() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"id":"{}"}}"#, id);
        let parsed: StreamDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, id);
        assert!(parsed.content_type.is_none());
        assert!(parsed.length.is_none());
    }
}
