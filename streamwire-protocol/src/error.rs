//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
///
/// Every malformed-header case has its own variant so the receive loop can
/// report exactly what was wrong with the bytes it read.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid header length: expected {expected} bytes, got {actual}")]
    InvalidHeaderLength { expected: usize, actual: usize },

    #[error("header type delimiter missing at offset 1 (got {0:#04x})")]
    InvalidTypeDelimiter(u8),

    #[error("header length delimiter missing at offset 8 (got {0:#04x})")]
    InvalidLengthDelimiter(u8),

    #[error("header id delimiter missing at offset 45 (got {0:#04x})")]
    InvalidIdDelimiter(u8),

    #[error("header terminator missing at offset 47 (got {0:#04x})")]
    InvalidTerminator(u8),

    #[error("header payload length is not a 6-digit decimal: {0:?}")]
    InvalidPayloadLength(String),

    #[error("header id is not a hyphenated 128-bit identifier: {0:?}")]
    InvalidId(String),

    #[error("header end flag must be '0' or '1' (got {0:#04x})")]
    InvalidEndFlag(u8),

    #[error("unknown payload type: {0:?}")]
    UnknownPayloadType(char),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Returns whether this error was raised while parsing a frame header.
    pub fn is_framing(&self) -> bool {
        !matches!(
            self,
            ProtocolError::PayloadTooLarge { .. } | ProtocolError::Json(_) | ProtocolError::InvalidUtf8
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidHeaderLength {
            expected: 48,
            actual: 47,
        };
        let msg = err.to_string();
        assert!(msg.contains("48") && msg.contains("47"));

        let err = ProtocolError::InvalidTerminator(b'x');
        assert!(err.to_string().contains("0x78"));

        let err = ProtocolError::InvalidPayloadLength("00a123".to_string());
        assert!(err.to_string().contains("00a123"));

        let err = ProtocolError::UnknownPayloadType('Z');
        assert!(err.to_string().contains('Z'));

        let err = ProtocolError::PayloadTooLarge {
            size: 1_000_000,
            max: 999_999,
        };
        assert!(err.to_string().contains("1000000"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_is_framing() {
        assert!(ProtocolError::InvalidIdDelimiter(b'-').is_framing());
        assert!(ProtocolError::InvalidEndFlag(b'2').is_framing());
        assert!(!ProtocolError::InvalidUtf8.is_framing());
        assert!(!ProtocolError::PayloadTooLarge { size: 2, max: 1 }.is_framing());
    }
}
