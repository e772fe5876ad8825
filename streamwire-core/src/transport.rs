//! Duplex byte channel abstraction.
//!
//! The engine only needs a reader that returns 0 on close, a writer that
//! reports how many bytes it accepted, and a way to shut the writer down.
//! Any tokio `AsyncRead + AsyncWrite` type satisfies that contract.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// Read half handed to the payload receiver.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half handed to the payload sender.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Splits any duplex stream into boxed halves.
pub fn split<T>(stream: T) -> (BoxedReader, BoxedWriter)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (Box::new(read_half), Box::new(write_half))
}

pin_project! {
    /// A transport that can be either a TCP socket or an in-process pipe.
    #[project = TransportProj]
    pub enum Transport {
        Tcp { #[pin] stream: TcpStream },
        Memory { #[pin] stream: DuplexStream },
    }
}

impl Transport {
    /// Wraps a connected TCP socket.
    pub fn tcp(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        Transport::Tcp { stream }
    }

    /// Creates a connected pair of in-process transports.
    pub fn memory_pair(max_buf_size: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (Transport::Memory { stream: a }, Transport::Memory { stream: b })
    }

    /// Returns a short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Tcp { .. } => "tcp",
            Transport::Memory { .. } => "memory",
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Tcp { stream } => stream.poll_read(cx, buf),
            TransportProj::Memory { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportProj::Tcp { stream } => stream.poll_write(cx, buf),
            TransportProj::Memory { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Tcp { stream } => stream.poll_flush(cx),
            TransportProj::Memory { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Tcp { stream } => stream.poll_shutdown(cx),
            TransportProj::Memory { stream } => stream.poll_shutdown(cx),
        }
    }
}
