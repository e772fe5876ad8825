//! # streamwire-protocol
//!
//! Wire protocol implementation for streamwire.
//!
//! This crate provides:
//! - The fixed 48-byte ASCII frame header and its codec
//! - Payload type codes (request, response, stream, cancel-all, cancel-stream)
//! - JSON message bodies for requests and responses
//! - Framing error taxonomy and protocol constants

pub mod codec;
pub mod error;
pub mod header;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use header::{Header, PayloadType};
pub use message::{RequestPayload, ResponsePayload, StreamDescription};

/// Size of a serialized frame header in bytes.
pub const MAX_HEADER_LENGTH: usize = 48;

/// Maximum number of bytes moved per transport I/O call, and per frame of
/// a stream whose total length is not known upfront.
pub const MAX_PAYLOAD_LENGTH: usize = 4096;

/// Largest value representable by the 6-digit length field.
pub const MAX_LENGTH: usize = 999_999;
