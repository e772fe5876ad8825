//! Encoder and decoder for request and response message bodies.

use crate::error::ProtocolError;
use crate::message::{RequestPayload, ResponsePayload};
use crate::MAX_LENGTH;
use bytes::Bytes;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Encodes message bodies into frame payloads.
pub struct Encoder;

impl Encoder {
    /// Encodes a request body.
    pub fn encode_request(request: &RequestPayload) -> Result<Bytes, ProtocolError> {
        Self::encode_json(request)
    }

    /// Encodes a response body.
    pub fn encode_response(response: &ResponsePayload) -> Result<Bytes, ProtocolError> {
        Self::encode_json(response)
    }

    /// Encodes any JSON-serializable value into a single-frame body.
    pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        if payload.len() > MAX_LENGTH {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_LENGTH,
            });
        }
        Ok(Bytes::from(payload))
    }
}

/// Decodes frame payloads into message bodies.
pub struct Decoder;

impl Decoder {
    /// Decodes a request body.
    pub fn decode_request(payload: &[u8]) -> Result<RequestPayload, ProtocolError> {
        Self::decode_json(payload)
    }

    /// Decodes a response body.
    pub fn decode_response(payload: &[u8]) -> Result<ResponsePayload, ProtocolError> {
        Self::decode_json(payload)
    }

    /// Decodes a UTF-8 JSON body, tolerating a leading byte-order mark.
    pub fn decode_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
        let payload = payload.strip_prefix(UTF8_BOM).unwrap_or(payload);
        let json = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(json)?)
    }
}
