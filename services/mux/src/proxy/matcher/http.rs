//! HTTP-family matcher.
//!
//! Recognizes HTTP/1.x request lines and splits them into three sub-modes:
//! CONNECT tunnels, plain origin-form requests, and absolute-URI requests
//! sent by clients that use this server as an HTTP proxy.

use tracing::debug;

use super::{MatchResult, ProtocolMatcher};
use crate::proxy::error::MuxError;
use crate::proxy::pipeline::{
    Pipeline, Stage, DEFAULT_AGGREGATOR_MAX_BYTES, HTTP_CONNECT_HANDLER, HTTP_PROXY_HANDLER,
    HTTP_REQUEST_HANDLER,
};

/// Request methods accepted as HTTP.
pub const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "HEAD", "OPTIONS", "PATCH", "DELETE", "TRACE", "CONNECT",
];

/// Minimum bytes before any decision.
const MIN_BYTES: usize = 5;

/// The method separator must appear in the first `SPACE_WINDOW` bytes.
const SPACE_WINDOW: usize = 9;

/// With this many bytes and no separator in the window, the buffer is not HTTP.
const REJECT_WITHOUT_SPACE: usize = 8;

/// HTTP sub-protocol detected from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMode {
    /// `CONNECT host:port`, becomes a raw tunnel.
    Connect,
    /// Origin-form request (`GET /path`).
    Plain,
    /// Absolute-form request (`GET http://host/path`).
    Proxy,
}

/// Verdict of scanning a request line prefix.
enum Scan {
    Mode(HttpMode),
    Undecided(MatchResult),
}

/// Matcher for plain HTTP, CONNECT and proxy-style HTTP.
#[derive(Debug, Clone)]
pub struct HttpMatcher {
    aggregator_max_bytes: usize,
}

impl HttpMatcher {
    /// Create a matcher with the default aggregator limit.
    pub fn new() -> Self {
        Self::with_aggregator_limit(DEFAULT_AGGREGATOR_MAX_BYTES)
    }

    /// Create a matcher whose plain-HTTP pipeline aggregates up to `max_bytes`.
    pub fn with_aggregator_limit(max_bytes: usize) -> Self {
        Self {
            aggregator_max_bytes: max_bytes,
        }
    }

    /// Sub-mode of a buffer, if it matches.
    pub fn mode(buf: &[u8]) -> Option<HttpMode> {
        match scan(buf) {
            Scan::Mode(mode) => Some(mode),
            Scan::Undecided(_) => None,
        }
    }
}

impl Default for HttpMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn scan(buf: &[u8]) -> Scan {
    if buf.len() < MIN_BYTES {
        return Scan::Undecided(MatchResult::NeedMoreData);
    }

    let window = &buf[..buf.len().min(SPACE_WINDOW)];
    let Some(space) = window.iter().position(|&b| b == b' ') else {
        if buf.len() < REJECT_WITHOUT_SPACE {
            return Scan::Undecided(MatchResult::NeedMoreData);
        }
        return Scan::Undecided(MatchResult::Rejected);
    };

    let first_uri_index = space + 1;
    if buf.len() < first_uri_index + 1 {
        return Scan::Undecided(MatchResult::NeedMoreData);
    }

    let method = &buf[..space];
    if !HTTP_METHODS.iter().any(|m| m.as_bytes() == method) {
        return Scan::Undecided(MatchResult::Rejected);
    }

    let mode = if method == b"CONNECT" {
        HttpMode::Connect
    } else if buf[first_uri_index] == b'/' {
        HttpMode::Plain
    } else {
        HttpMode::Proxy
    };
    Scan::Mode(mode)
}

impl ProtocolMatcher for HttpMatcher {
    fn name(&self) -> &'static str {
        "http"
    }

    fn probe(&self, buf: &[u8]) -> MatchResult {
        match scan(buf) {
            Scan::Mode(mode) => {
                match mode {
                    HttpMode::Connect => debug!("http connect request matched"),
                    HttpMode::Plain => debug!("http plain request matched"),
                    HttpMode::Proxy => debug!("http proxy request matched"),
                }
                MatchResult::Matched
            }
            Scan::Undecided(result) => result,
        }
    }

    fn max_probe_len(&self) -> usize {
        SPACE_WINDOW + 1
    }

    fn install(&self, buf: &[u8], pipeline: &mut Pipeline) -> Result<(), MuxError> {
        let Some(mode) = Self::mode(buf) else {
            return Err(MuxError::Invariant {
                matcher: self.name(),
                reason: "install called on a buffer that does not match".to_string(),
            });
        };

        match mode {
            HttpMode::Plain => {
                pipeline
                    .add_last(Stage::HttpCodec)
                    .add_last(Stage::ExpectContinue)
                    .add_last(Stage::Aggregator {
                        max_content_length: self.aggregator_max_bytes,
                    })
                    .add_last(Stage::ChunkedWriter)
                    .add_last(Stage::ContentCompressor)
                    .hand_off(HTTP_REQUEST_HANDLER);
            }
            HttpMode::Connect => {
                pipeline
                    .add_last(Stage::HttpCodec)
                    .hand_off(HTTP_CONNECT_HANDLER);
            }
            HttpMode::Proxy => {
                pipeline
                    .add_last(Stage::HttpCodec)
                    .add_last(Stage::ExpectContinue)
                    .hand_off(HTTP_PROXY_HANDLER);
            }
        }
        Ok(())
    }
}
