//! Fixed page served to direct HTTP visitors.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::head::{read_request_head, HeadRead, DEFAULT_HEAD_TIMEOUT};
use super::{respond_and_close, RESPONSE_TIMEOUT, RESPONSE_TOO_LARGE};
use crate::proxy::conn::Connection;
use crate::proxy::error::MuxError;
use crate::proxy::pipeline::{ConnectionHandler, Pipeline, DEFAULT_AGGREGATOR_MAX_BYTES};

/// Body of the default page.
pub const DEFAULT_PAGE: &str = "<!DOCTYPE html>\n\
<html>\n\
<head><title>Welcome</title></head>\n\
<body>\n\
<h1>It works!</h1>\n\
<p>This server is up and running.</p>\n\
</body>\n\
</html>\n";

/// Serves [`DEFAULT_PAGE`] to every request and closes.
///
/// Also usable as the multiplexer fallback: input that is not HTTP gets the
/// page too.
#[derive(Debug, Clone)]
pub struct DefaultPageHandler {
    max_head_bytes: usize,
    head_timeout: Duration,
    response: Vec<u8>,
    head_response_len: usize,
}

impl DefaultPageHandler {
    pub fn new() -> Self {
        Self::with_head_limit(DEFAULT_AGGREGATOR_MAX_BYTES)
    }

    /// Limit used when the pipeline carries no aggregator.
    pub fn with_head_limit(max_head_bytes: usize) -> Self {
        let head = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            DEFAULT_PAGE.len()
        );
        let mut response = head.into_bytes();
        let head_response_len = response.len();
        response.extend_from_slice(DEFAULT_PAGE.as_bytes());

        Self {
            max_head_bytes,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
            response,
            head_response_len,
        }
    }

    /// Time the client has to send its request head.
    pub fn with_head_timeout(mut self, head_timeout: Duration) -> Self {
        self.head_timeout = head_timeout;
        self
    }
}

impl Default for DefaultPageHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionHandler for DefaultPageHandler {
    async fn handle(&self, mut conn: Connection, pipeline: Pipeline) -> Result<(), MuxError> {
        let limit = pipeline.aggregator_limit().unwrap_or(self.max_head_bytes);

        let response = match read_request_head(&mut conn, limit, self.head_timeout).await? {
            HeadRead::Complete { head, .. } => {
                debug!(
                    peer_addr = %conn.peer(),
                    method = %head.method,
                    target = %head.target,
                    "Serving default page"
                );
                if head.method.eq_ignore_ascii_case("HEAD") {
                    &self.response[..self.head_response_len]
                } else {
                    &self.response[..]
                }
            }
            HeadRead::TooLarge => {
                debug!(peer_addr = %conn.peer(), limit, "Request head too large");
                RESPONSE_TOO_LARGE
            }
            HeadRead::Invalid(reason) => {
                debug!(
                    peer_addr = %conn.peer(),
                    reason = %reason,
                    "Serving default page to non-HTTP input"
                );
                &self.response[..]
            }
            HeadRead::TimedOut => {
                debug!(peer_addr = %conn.peer(), "Request head timeout");
                RESPONSE_TIMEOUT
            }
            HeadRead::Closed { .. } => return Ok(()),
        };

        respond_and_close(&mut conn, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::pipeline::{Stage, HTTP_REQUEST_HANDLER};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn plain_pipeline(limit: usize) -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline
            .add_last(Stage::HttpCodec)
            .add_last(Stage::ExpectContinue)
            .add_last(Stage::Aggregator {
                max_content_length: limit,
            })
            .add_last(Stage::ChunkedWriter)
            .add_last(Stage::ContentCompressor)
            .hand_off(HTTP_REQUEST_HANDLER);
        pipeline
    }

    async fn exchange(request: &[u8], pipeline: Pipeline) -> String {
        let (mut client, server) = tokio::io::duplex(16 * 1024);
        client.write_all(request).await.unwrap();

        DefaultPageHandler::new()
            .handle(Connection::new(server), pipeline)
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn test_serves_page() {
        let response = exchange(
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
            plain_pipeline(DEFAULT_AGGREGATOR_MAX_BYTES),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/html"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.contains(&format!("Content-Length: {}\r\n", DEFAULT_PAGE.len())));
        assert!(response.ends_with(DEFAULT_PAGE));
    }

    #[tokio::test]
    async fn test_head_request_has_no_body() {
        let response = exchange(
            b"HEAD / HTTP/1.1\r\n\r\n",
            plain_pipeline(DEFAULT_AGGREGATOR_MAX_BYTES),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_oversized_head() {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend_from_slice(format!("Cookie: {}\r\n\r\n", "c".repeat(512)).as_bytes());

        let response = exchange(&request, plain_pipeline(128)).await;
        assert!(response.starts_with("HTTP/1.1 413 "));
    }

    #[tokio::test]
    async fn test_non_http_fallback_gets_page() {
        let response = exchange(b"\x00\x01garbage\r\n\r\n", Pipeline::new()).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_stalled_head_gets_timeout() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        DefaultPageHandler::new()
            .with_head_timeout(Duration::from_millis(50))
            .handle(Connection::new(server), plain_pipeline(DEFAULT_AGGREGATOR_MAX_BYTES))
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 408 "));
    }
}
