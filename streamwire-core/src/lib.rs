//! # streamwire-core
//!
//! Streaming engine for streamwire.
//!
//! This crate provides:
//! - Ordered send queue and payload sender (frame writer)
//! - Payload receiver (frame reader loop)
//! - Stream buffers, assemblers and the stream registry
//! - Request/response correlation
//! - Send operations that break messages into frames
//! - `StreamingSession`, the public surface tying it all together

pub mod assembler;
pub mod config;
pub mod correlation;
pub mod disassembler;
pub mod error;
pub mod message;
pub mod receiver;
pub mod registry;
pub mod send_queue;
pub mod sender;
pub mod session;
pub mod stream_buffer;
pub mod transport;

pub use assembler::StreamAssembler;
pub use config::{Config, ConfigError, NetworkConfig, SessionConfig};
pub use correlation::{CorrelationTable, PendingResponse};
pub use disassembler::SendOperations;
pub use error::{Result, StreamingError};
pub use message::{
    ContentStream, ReceiveRequest, ReceiveResponse, ReceivedStream, StreamingRequest,
    StreamingResponse,
};
pub use receiver::{PayloadReceiver, ReceiveHandler};
pub use registry::{StreamCancelled, StreamRegistry};
pub use send_queue::SendQueue;
pub use sender::{DisconnectedEvent, PayloadBody, PayloadSender};
pub use session::{RequestHandler, SessionDisconnected, StreamingSession};
pub use stream_buffer::StreamBuffer;
pub use transport::{split, BoxedReader, BoxedWriter, Transport};
