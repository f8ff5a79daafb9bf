//! Forwarding of absolute-URI requests from HTTP proxy clients.
//!
//! The request head is rewritten to origin form and sent to the host named
//! in the URI, then the connection is relayed as-is. The upstream is asked to
//! close after its response, so one client connection carries one request.

use std::time::Duration;

use async_trait::async_trait;
use proxyhub_networking::{parse_address, NetAddress};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::head::{read_request_head, HeadRead, RequestHead, DEFAULT_HEAD_TIMEOUT};
use super::{
    respond_and_close, RESPONSE_BAD_GATEWAY, RESPONSE_BAD_REQUEST, RESPONSE_TIMEOUT,
    RESPONSE_TOO_LARGE,
};
use crate::proxy::conn::Connection;
use crate::proxy::error::MuxError;
use crate::proxy::pipeline::{ConnectionHandler, Pipeline, Stage};
use crate::proxy::relay::Relay;
use crate::proxy::upstream::{connect_upstream, DEFAULT_CONNECT_TIMEOUT};

/// Port used when the request URI has none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

const MAX_FORWARD_HEAD_BYTES: usize = 32 * 1024;

const RESPONSE_CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Handler for proxy-style requests (`GET http://host/path`).
#[derive(Debug, Clone)]
pub struct ForwardHandler {
    connect_timeout: Duration,
    head_timeout: Duration,
}

impl ForwardHandler {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    pub fn with_head_timeout(mut self, head_timeout: Duration) -> Self {
        self.head_timeout = head_timeout;
        self
    }
}

impl Default for ForwardHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionHandler for ForwardHandler {
    async fn handle(&self, mut conn: Connection, pipeline: Pipeline) -> Result<(), MuxError> {
        let limit = pipeline.aggregator_limit().unwrap_or(MAX_FORWARD_HEAD_BYTES);

        let (head, rest) = match read_request_head(&mut conn, limit, self.head_timeout).await? {
            HeadRead::Complete { head, rest } => (head, rest),
            HeadRead::TooLarge => {
                respond_and_close(&mut conn, RESPONSE_TOO_LARGE).await?;
                return Err(MuxError::MalformedRequest("request head too large".to_string()));
            }
            HeadRead::Invalid(reason) => {
                respond_and_close(&mut conn, RESPONSE_BAD_REQUEST).await?;
                return Err(MuxError::MalformedRequest(reason));
            }
            HeadRead::Closed { received } => {
                debug!(peer_addr = %conn.peer(), received, "Client closed before request head");
                return Ok(());
            }
            HeadRead::TimedOut => {
                debug!(peer_addr = %conn.peer(), "Proxy request head timeout");
                return respond_and_close(&mut conn, RESPONSE_TIMEOUT).await;
            }
        };

        let (target, path) = match split_absolute_uri(&head.target) {
            Ok(parts) => parts,
            Err(e) => {
                respond_and_close(&mut conn, RESPONSE_BAD_REQUEST).await?;
                return Err(e);
            }
        };

        debug!(
            peer_addr = %conn.peer(),
            method = %head.method,
            upstream = %target,
            path = %path,
            "Forwarding proxy request"
        );

        let mut upstream = match connect_upstream(&target, self.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                respond_and_close(&mut conn, RESPONSE_BAD_GATEWAY).await?;
                return Err(e);
            }
        };

        let answer_continue =
            pipeline.contains(Stage::ExpectContinue) && head.expects_continue();
        if answer_continue {
            conn.write_all(RESPONSE_CONTINUE).await?;
            conn.flush().await?;
        }

        upstream
            .write_all(&origin_form_head(&head, &target, &path, answer_continue))
            .await?;
        if !rest.is_empty() {
            upstream.write_all(&rest).await?;
        }
        upstream.flush().await?;

        let stats = Relay::new(conn, upstream).run().await;
        debug!(
            upstream = %target,
            to_target = stats.to_target,
            to_client = stats.to_client,
            "Proxy request done"
        );
        Ok(())
    }
}

/// Split `http://authority/path` into the upstream address and origin-form path.
fn split_absolute_uri(uri: &str) -> Result<(NetAddress, String), MuxError> {
    let scheme_len = "http://".len();
    let without_scheme = match uri.get(..scheme_len) {
        Some(scheme) if scheme.eq_ignore_ascii_case("http://") => &uri[scheme_len..],
        _ => {
            return Err(MuxError::MalformedRequest(format!(
                "unsupported request target {:?}",
                uri
            )))
        }
    };

    let authority_end = without_scheme
        .find(['/', '?'])
        .unwrap_or(without_scheme.len());
    let (authority, path) = without_scheme.split_at(authority_end);

    // Credentials in the authority are never forwarded
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let mut target = parse_address(authority)?;
    if target.host.is_empty() {
        return Err(MuxError::MalformedRequest(format!(
            "missing host in {:?}",
            uri
        )));
    }
    target.port = Some(target.port_or(DEFAULT_HTTP_PORT));

    let path = match path {
        "" => "/".to_string(),
        p if p.starts_with('?') => format!("/{}", p),
        p => p.to_string(),
    };
    Ok((target, path))
}

fn is_dropped_header(name: &str, continue_answered: bool) -> bool {
    name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || (continue_answered && name.eq_ignore_ascii_case("expect"))
}

fn origin_form_head(
    head: &RequestHead,
    target: &NetAddress,
    path: &str,
    continue_answered: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len + 32);
    out.extend_from_slice(
        format!("{} {} HTTP/1.{}\r\n", head.method, path, head.version).as_bytes(),
    );

    if head.header("host").is_none() {
        let host = match target.port {
            Some(DEFAULT_HTTP_PORT) | None => NetAddress::new(target.host.clone(), None),
            Some(_) => target.clone(),
        };
        out.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
    }

    for (name, value) in &head.headers {
        if is_dropped_header(name, continue_answered) {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::handlers::testing::closed_port;
    use crate::proxy::pipeline::HTTP_PROXY_HANDLER;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn proxy_pipeline() -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline
            .add_last(Stage::HttpCodec)
            .add_last(Stage::ExpectContinue)
            .hand_off(HTTP_PROXY_HANDLER);
        pipeline
    }

    /// Upstream that captures one request (head plus `body_len` bytes) and
    /// answers with a short 200.
    async fn spawn_origin(body_len: usize) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            let head_end = loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert_ne!(n, 0, "client closed before head end");
                request.extend_from_slice(&buf[..n]);
                if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            while request.len() < head_end + body_len {
                let n = stream.read(&mut buf).await.unwrap();
                assert_ne!(n, 0, "client closed before body end");
                request.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
            let _ = tx.send(request);
        });

        (addr, rx)
    }

    #[test]
    fn test_split_absolute_uri() {
        let (target, path) = split_absolute_uri("http://example.com/x?y=1").unwrap();
        assert_eq!(target, NetAddress::new("example.com", Some(80)));
        assert_eq!(path, "/x?y=1");

        let (target, path) = split_absolute_uri("HTTP://user:pw@example.com:8080").unwrap();
        assert_eq!(target, NetAddress::new("example.com", Some(8080)));
        assert_eq!(path, "/");

        let (_, path) = split_absolute_uri("http://example.com?q").unwrap();
        assert_eq!(path, "/?q");

        let (target, _) = split_absolute_uri("http://[::1]:8080/").unwrap();
        assert_eq!(target, NetAddress::new("::1", Some(8080)));

        assert!(split_absolute_uri("https://example.com/").is_err());
        assert!(split_absolute_uri("*").is_err());
        assert!(split_absolute_uri("http:///path").is_err());
        assert!(split_absolute_uri("http://example.com:http/").is_err());
    }

    #[test]
    fn test_origin_form_head() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "http://example.com:8080/a".to_string(),
            version: 1,
            headers: vec![
                ("Accept".to_string(), b"*/*".to_vec()),
                ("Proxy-Connection".to_string(), b"keep-alive".to_vec()),
                ("Proxy-Authorization".to_string(), b"Basic eDp5".to_vec()),
            ],
            len: 0,
        };
        let target = NetAddress::new("example.com", Some(8080));
        let out = origin_form_head(&head, &target, "/a", false);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "GET /a HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_forward_rewrites_request() {
        let (origin, captured) = spawn_origin(0).await;
        let (mut client, server) = tokio::io::duplex(4096);

        let request = format!(
            "GET http://127.0.0.1:{}/index.html HTTP/1.1\r\nHost: 127.0.0.1\r\nProxy-Connection: keep-alive\r\n\r\n",
            origin.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let task = tokio::spawn(async move {
            ForwardHandler::new()
                .handle(Connection::new(server), proxy_pipeline())
                .await
        });

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(b"\r\n\r\nok"));

        let seen = String::from_utf8(captured.await.unwrap()).unwrap();
        assert_eq!(
            seen,
            "GET /index.html HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n"
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_answers_expect_continue() {
        let (origin, captured) = spawn_origin(4).await;
        let (mut client, server) = tokio::io::duplex(4096);

        let request = format!(
            "POST http://127.0.0.1:{}/upload HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
            origin.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let task = tokio::spawn(async move {
            ForwardHandler::new()
                .handle(Connection::new(server), proxy_pipeline())
                .await
        });

        let mut interim = vec![0u8; RESPONSE_CONTINUE.len()];
        client.read_exact(&mut interim).await.unwrap();
        assert_eq!(interim, RESPONSE_CONTINUE);

        client.write_all(b"body").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));

        let seen = String::from_utf8(captured.await.unwrap()).unwrap();
        assert!(seen.starts_with("POST /upload HTTP/1.1\r\n"));
        assert!(!seen.to_ascii_lowercase().contains("expect:"));
        assert!(seen.ends_with("\r\n\r\nbody"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_rejects_other_schemes() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET ftp://example.com/file HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let err = ForwardHandler::new()
            .handle(Connection::new(server), proxy_pipeline())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::MalformedRequest(_)));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, RESPONSE_BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_forward_upstream_unavailable() {
        let port = closed_port().await;
        let (mut client, server) = tokio::io::duplex(4096);
        let request = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port);
        client.write_all(request.as_bytes()).await.unwrap();

        let err = ForwardHandler::new()
            .handle(Connection::new(server), proxy_pipeline())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Upstream { .. }));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, RESPONSE_BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_forward_stalled_head_times_out() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\n")
            .await
            .unwrap();

        ForwardHandler::new()
            .with_head_timeout(Duration::from_millis(50))
            .handle(Connection::new(server), proxy_pipeline())
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, RESPONSE_TIMEOUT);
    }
}
