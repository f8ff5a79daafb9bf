//! HTTP CONNECT tunnels.

use std::time::Duration;

use async_trait::async_trait;
use proxyhub_networking::parse_address;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::head::{read_request_head, HeadRead, DEFAULT_HEAD_TIMEOUT};
use super::{
    respond_and_close, RESPONSE_BAD_GATEWAY, RESPONSE_BAD_REQUEST, RESPONSE_TIMEOUT,
    RESPONSE_TOO_LARGE,
};
use crate::proxy::conn::Connection;
use crate::proxy::error::MuxError;
use crate::proxy::pipeline::{ConnectionHandler, Pipeline};
use crate::proxy::relay::Relay;
use crate::proxy::upstream::{connect_upstream, DEFAULT_CONNECT_TIMEOUT};

/// Port used when a CONNECT target has none.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Largest CONNECT head accepted.
const MAX_CONNECT_HEAD_BYTES: usize = 32 * 1024;

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Handler for `CONNECT host:port` requests.
#[derive(Debug, Clone)]
pub struct ConnectHandler {
    connect_timeout: Duration,
    head_timeout: Duration,
}

impl ConnectHandler {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    /// Time the client has to send the full CONNECT head.
    pub fn with_head_timeout(mut self, head_timeout: Duration) -> Self {
        self.head_timeout = head_timeout;
        self
    }
}

impl Default for ConnectHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionHandler for ConnectHandler {
    async fn handle(&self, mut conn: Connection, pipeline: Pipeline) -> Result<(), MuxError> {
        let limit = pipeline.aggregator_limit().unwrap_or(MAX_CONNECT_HEAD_BYTES);

        let (head, rest) = match read_request_head(&mut conn, limit, self.head_timeout).await? {
            HeadRead::Complete { head, rest } => (head, rest),
            HeadRead::TooLarge => {
                respond_and_close(&mut conn, RESPONSE_TOO_LARGE).await?;
                return Err(MuxError::MalformedRequest(
                    "CONNECT head too large".to_string(),
                ));
            }
            HeadRead::Invalid(reason) => {
                respond_and_close(&mut conn, RESPONSE_BAD_REQUEST).await?;
                return Err(MuxError::MalformedRequest(reason));
            }
            HeadRead::Closed { received } => {
                debug!(peer_addr = %conn.peer(), received, "Client closed before CONNECT head");
                return Ok(());
            }
            HeadRead::TimedOut => {
                debug!(peer_addr = %conn.peer(), "CONNECT head timeout");
                return respond_and_close(&mut conn, RESPONSE_TIMEOUT).await;
            }
        };

        if !head.method.eq_ignore_ascii_case("CONNECT") {
            respond_and_close(&mut conn, RESPONSE_BAD_REQUEST).await?;
            return Err(MuxError::MalformedRequest(format!(
                "expected CONNECT, got {}",
                head.method
            )));
        }

        let mut target = match parse_address(&head.target) {
            Ok(target) if !target.host.is_empty() => target,
            Ok(_) => {
                respond_and_close(&mut conn, RESPONSE_BAD_REQUEST).await?;
                return Err(MuxError::MalformedRequest("empty CONNECT host".to_string()));
            }
            Err(e) => {
                respond_and_close(&mut conn, RESPONSE_BAD_REQUEST).await?;
                return Err(e.into());
            }
        };
        target.port = Some(target.port_or(DEFAULT_CONNECT_PORT));

        debug!(peer_addr = %conn.peer(), upstream = %target, "CONNECT");

        let mut upstream = match connect_upstream(&target, self.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                respond_and_close(&mut conn, RESPONSE_BAD_GATEWAY).await?;
                return Err(e);
            }
        };

        conn.write_all(RESPONSE_ESTABLISHED).await?;
        conn.flush().await?;

        // Bytes the client pipelined after the head
        if !rest.is_empty() {
            upstream.write_all(&rest).await?;
        }

        let stats = Relay::new(conn, upstream).run().await;
        debug!(
            upstream = %target,
            to_target = stats.to_target + rest.len() as u64,
            to_client = stats.to_client,
            "CONNECT tunnel done"
        );
        Ok(())
    }
}
