use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A connected duplex stream; implements `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type handed out by dialers and listeners.
/// It wraps a TCP stream, a Unix domain socket stream, or one end of an
/// in-memory pipe.
pub struct RpcStream {
    inner: RpcStreamInner,
    peer: String,
}

enum RpcStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Memory(DuplexStream),
}

impl RpcStream {
    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp:unknown".to_string());
        Self {
            inner: RpcStreamInner::Tcp(stream),
            peer,
        }
    }

    /// Wrap a connected Unix domain socket stream.
    #[cfg(unix)]
    pub fn from_unix(stream: tokio::net::UnixStream, peer: impl Into<String>) -> Self {
        Self {
            inner: RpcStreamInner::Unix(stream),
            peer: peer.into(),
        }
    }

    /// Wrap one end of an in-memory pipe.
    pub fn from_memory(stream: DuplexStream, peer: impl Into<String>) -> Self {
        Self {
            inner: RpcStreamInner::Memory(stream),
            peer: peer.into(),
        }
    }

    /// Human-readable peer label for diagnostics.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            RpcStreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            RpcStreamInner::Unix(_) => "unix-domain-socket",
            RpcStreamInner::Memory(_) => "memory",
        }
    }

    /// Disable Nagle's algorithm on TCP streams. No-op for other transports.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match &self.inner {
            RpcStreamInner::Tcp(stream) => stream.set_nodelay(nodelay),
            _ => Ok(()),
        }
    }
}

impl AsyncRead for RpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            RpcStreamInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            RpcStreamInner::Memory(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            RpcStreamInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            RpcStreamInner::Memory(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            RpcStreamInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
            RpcStreamInner::Memory(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            RpcStreamInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            RpcStreamInner::Memory(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("type", &self.transport_name())
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn memory_stream_reads_and_writes() {
        let (left, right) = tokio::io::duplex(64);
        let mut left = RpcStream::from_memory(left, "left");
        let mut right = RpcStream::from_memory(right, "right");

        left.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello");
        assert_eq!(left.transport_name(), "memory");
        assert_eq!(right.peer(), "right");
    }

    #[tokio::test]
    async fn nodelay_is_noop_for_memory() {
        let (left, _right) = tokio::io::duplex(8);
        let stream = RpcStream::from_memory(left, "mem");
        assert!(stream.set_nodelay(true).is_ok());
    }

    #[tokio::test]
    async fn debug_output_names_transport() {
        let (left, _right) = tokio::io::duplex(8);
        let stream = RpcStream::from_memory(left, "mem-1");
        let dbg = format!("{stream:?}");
        assert!(dbg.contains("memory"));
        assert!(dbg.contains("mem-1"));
    }
}
