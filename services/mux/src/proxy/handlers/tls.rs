//! TLS passthrough routed on SNI.
//!
//! The ClientHello record is read in full, the SNI hostname picks the
//! upstream, and the record is forwarded unchanged before relaying. TLS is
//! never terminated here.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use proxyhub_networking::{wildcard_host, NetAddress};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::head::DEFAULT_HEAD_TIMEOUT;
use crate::proxy::conn::Connection;
use crate::proxy::error::MuxError;
use crate::proxy::matcher::{parse_sni, SniResult, RECORD_HANDSHAKE, RECORD_HEADER_LEN};
use crate::proxy::pipeline::{ConnectionHandler, Pipeline};
use crate::proxy::relay::Relay;
use crate::proxy::sniffer::DEFAULT_MAX_SNIFF_BYTES;
use crate::proxy::upstream::{connect_upstream, DEFAULT_CONNECT_TIMEOUT};

/// Upstream port for passthrough connections.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Handler forwarding TLS connections to the host named in their SNI.
#[derive(Debug, Clone)]
pub struct TlsPassthroughHandler {
    upstream_port: u16,
    connect_timeout: Duration,
    hello_timeout: Duration,
    max_hello_bytes: usize,
}

impl TlsPassthroughHandler {
    pub fn new() -> Self {
        Self {
            upstream_port: DEFAULT_TLS_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            hello_timeout: DEFAULT_HEAD_TIMEOUT,
            max_hello_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }

    pub fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = port;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Time the client has to send its full ClientHello record.
    pub fn with_hello_timeout(mut self, hello_timeout: Duration) -> Self {
        self.hello_timeout = hello_timeout;
        self
    }
}

impl Default for TlsPassthroughHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionHandler for TlsPassthroughHandler {
    async fn handle(&self, mut conn: Connection, _pipeline: Pipeline) -> Result<(), MuxError> {
        let read = timeout(
            self.hello_timeout,
            read_client_hello(&mut conn, self.max_hello_bytes),
        )
        .await;
        let hello = match read {
            Ok(hello) => hello?,
            Err(_) => {
                debug!(peer_addr = %conn.peer(), "ClientHello timeout, closing");
                let _ = conn.shutdown().await;
                return Ok(());
            }
        };

        let host = match parse_sni(&hello) {
            SniResult::Found(host) => host,
            other => {
                debug!(peer_addr = %conn.peer(), result = ?other, "No routable SNI, closing");
                let _ = conn.shutdown().await;
                return Ok(());
            }
        };

        debug!(
            peer_addr = %conn.peer(),
            sni = %host,
            wildcard_host = %wildcard_host(&host),
            "TLS passthrough"
        );

        let target = NetAddress::new(host, Some(self.upstream_port));
        let mut upstream = match connect_upstream(&target, self.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = conn.shutdown().await;
                return Err(e);
            }
        };
        upstream.write_all(&hello).await?;

        let stats = Relay::new(conn, upstream).run().await;
        debug!(
            upstream = %target,
            to_target = stats.to_target + hello.len() as u64,
            to_client = stats.to_client,
            "TLS passthrough done"
        );
        Ok(())
    }
}

/// Read the first TLS record, up to `max_bytes`.
///
/// Returns fewer bytes when the stream ends early or does not start with a
/// handshake record.
async fn read_client_hello<R>(stream: &mut R, max_bytes: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; max_bytes.max(RECORD_HEADER_LEN)];
    let mut total_read = 0;

    while total_read < RECORD_HEADER_LEN {
        let n = stream.read(&mut buffer[total_read..RECORD_HEADER_LEN]).await?;
        if n == 0 {
            buffer.truncate(total_read);
            return Ok(buffer);
        }
        total_read += n;
    }

    if buffer[0] != RECORD_HANDSHAKE {
        buffer.truncate(total_read);
        return Ok(buffer);
    }

    let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
    let target_len = (RECORD_HEADER_LEN + record_len).min(buffer.len());

    while total_read < target_len {
        let n = stream.read(&mut buffer[total_read..target_len]).await?;
        if n == 0 {
            break;
        }
        total_read += n;
    }

    buffer.truncate(total_read);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::handlers::testing::spawn_echo;
    use crate::proxy::matcher::client_hello;

    #[tokio::test]
    async fn test_read_client_hello_stops_at_record_end() {
        let hello = client_hello("example.com");
        let mut input = hello.clone();
        input.extend_from_slice(b"application data");

        let mut reader = &input[..];
        let record = read_client_hello(&mut reader, 8192).await.unwrap();
        assert_eq!(record, hello);
        assert_eq!(reader, b"application data");
    }

    #[tokio::test]
    async fn test_read_client_hello_not_tls() {
        let mut reader = &b"GET / HTTP/1.1\r\n"[..];
        let record = read_client_hello(&mut reader, 8192).await.unwrap();
        assert_eq!(record, b"GET /");
    }

    #[tokio::test]
    async fn test_passthrough_to_sni_host() {
        let echo = spawn_echo().await;
        let handler = TlsPassthroughHandler::new().with_upstream_port(echo.port());

        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(async move {
            handler
                .handle(Connection::new(server), Pipeline::new())
                .await
        });

        let mut sent = client_hello("localhost");
        sent.extend_from_slice(b"app");
        client.write_all(&sent).await.unwrap();

        let mut echoed = vec![0u8; sent.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, sent);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_sni_closes() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"\x16\x03\x01\x00\x02\x02\x00").await.unwrap();

        TlsPassthroughHandler::new()
            .handle(Connection::new(server), Pipeline::new())
            .await
            .unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_hello_closes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let hello = client_hello("example.com");
        client.write_all(&hello[..20]).await.unwrap();

        TlsPassthroughHandler::new()
            .with_hello_timeout(Duration::from_millis(50))
            .handle(Connection::new(server), Pipeline::new())
            .await
            .unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
