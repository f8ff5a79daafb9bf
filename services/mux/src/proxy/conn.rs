//! Connection wrapper shared by the multiplexer, handlers and relay.
//!
//! A [`Connection`] is a type-erased duplex byte stream plus the socket
//! addresses of its endpoints. Bytes consumed while sniffing are pushed back
//! with [`Connection::replay`] so that whoever owns the connection next reads
//! them again, in order, before anything still on the socket.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Object-safe alias for the streams a [`Connection`] can carry.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An accepted (or dialed) byte stream.
pub struct Connection {
    stream: Box<dyn AsyncStream>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap an arbitrary stream with unknown addresses.
    pub fn new<S: AsyncStream + 'static>(stream: S) -> Self {
        Self {
            stream: Box::new(stream),
            peer_addr: None,
            local_addr: None,
        }
    }

    /// Wrap a TCP stream, recording both socket addresses.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        Ok(Self::new(stream).with_addrs(Some(peer_addr), Some(local_addr)))
    }

    /// Set the endpoint addresses.
    pub fn with_addrs(
        mut self,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        self.peer_addr = peer_addr;
        self.local_addr = local_addr;
        self
    }

    /// Remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address, if known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Push `prefix` back so it is read before the rest of the stream.
    pub fn replay(self, prefix: Bytes) -> Self {
        if prefix.is_empty() {
            return self;
        }
        Self {
            stream: Box::new(Replay::new(prefix, self.stream)),
            peer_addr: self.peer_addr,
            local_addr: self.local_addr,
        }
    }

    /// Printable remote address.
    pub fn peer(&self) -> Endpoint {
        Endpoint(self.peer_addr)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Display adapter for an optional socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint(pub Option<SocketAddr>);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("unknown"),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

/// Stream that yields a buffered prefix before reading from `inner`.
///
/// Writes go straight to `inner`.
pub struct Replay<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Replay<S> {
    /// Create a replay stream.
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes of the prefix not yet read.
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Replay<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replay<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_replay_reads_prefix_first() {
        let inner = tokio_test::io::Builder::new().read(b" world").build();
        let mut stream = Replay::new(Bytes::from_static(b"hello"), inner);

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert!(stream.pending().is_empty());
    }

    #[tokio::test]
    async fn test_replay_small_reads() {
        let inner = tokio_test::io::Builder::new().read(b"cd").build();
        let mut stream = Replay::new(Bytes::from_static(b"ab"), inner);

        let mut one = [0u8; 1];
        stream.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"a");
        assert_eq!(stream.pending(), b"b");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bcd");
    }

    #[tokio::test]
    async fn test_connection_replay_and_addrs() {
        let (client, server) = tokio::io::duplex(64);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let conn = Connection::new(server)
            .with_addrs(Some(peer), None)
            .replay(Bytes::from_static(b"GET "));

        assert_eq!(conn.peer_addr(), Some(peer));
        assert_eq!(conn.peer().to_string(), "127.0.0.1:40000");
        assert_eq!(Endpoint(None).to_string(), "unknown");

        let mut client = client;
        client.write_all(b"/ HTTP/1.1").await.unwrap();
        drop(client);

        let mut conn = conn;
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.1");
    }
}
