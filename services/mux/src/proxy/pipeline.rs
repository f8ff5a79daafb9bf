//! Pipeline model installed by a matcher after protocol detection.
//!
//! A [`Pipeline`] is the ordered list of stages a matcher appends plus the
//! name of the terminal handler the connection is handed to. Handlers are
//! looked up by name in a [`Handlers`] registry supplied by the embedding
//! server, so matchers never depend on handler implementations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::conn::Connection;
use super::error::MuxError;

/// Handler for plain (origin-form) HTTP requests.
pub const HTTP_REQUEST_HANDLER: &str = "http-request";
/// Handler for HTTP CONNECT handshakes.
pub const HTTP_CONNECT_HANDLER: &str = "http-connect";
/// Handler for absolute-URI requests sent to us as an HTTP proxy.
pub const HTTP_PROXY_HANDLER: &str = "http-proxy";
/// Handler for TLS connections routed on SNI.
pub const TLS_PASSTHROUGH_HANDLER: &str = "tls-passthrough";

/// Default cap for the full-message aggregator.
pub const DEFAULT_AGGREGATOR_MAX_BYTES: usize = 65536;

/// A processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// HTTP/1.x request decoding and response encoding.
    HttpCodec,
    /// Answers `Expect: 100-continue` on behalf of the handler.
    ExpectContinue,
    /// Buffers a full message up to the given size.
    Aggregator { max_content_length: usize },
    /// Writes chunked responses.
    ChunkedWriter,
    /// Compresses outbound content.
    ContentCompressor,
    /// Raw TLS bytes, inspected for SNI only.
    TlsPassthrough,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::HttpCodec => f.write_str("http-codec"),
            Stage::ExpectContinue => f.write_str("expect-continue"),
            Stage::Aggregator { max_content_length } => {
                write!(f, "aggregator({})", max_content_length)
            }
            Stage::ChunkedWriter => f.write_str("chunked-writer"),
            Stage::ContentCompressor => f.write_str("content-compressor"),
            Stage::TlsPassthrough => f.write_str("tls-passthrough"),
        }
    }
}

/// Stages and terminal handler for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
    handler: Option<&'static str>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn add_last(&mut self, stage: Stage) -> &mut Self {
        self.stages.push(stage);
        self
    }

    /// Name the handler the connection is handed to.
    pub fn hand_off(&mut self, handler: &'static str) -> &mut Self {
        self.handler = Some(handler);
        self
    }

    /// Installed stages, in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Whether `stage` is installed.
    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// Aggregator limit, if an aggregator is installed.
    pub fn aggregator_limit(&self) -> Option<usize> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Aggregator { max_content_length } => Some(*max_content_length),
            _ => None,
        })
    }

    /// Terminal handler name.
    pub fn handler(&self) -> Option<&'static str> {
        self.handler
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in &self.stages {
            write!(f, "{} -> ", stage)?;
        }
        f.write_str(self.handler.unwrap_or("<none>"))
    }
}

/// Terminal owner of a classified connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Serve the connection until it is done.
    ///
    /// `conn` replays the bytes consumed during sniffing.
    async fn handle(&self, conn: Connection, pipeline: Pipeline) -> Result<(), MuxError>;
}

/// Registry of handlers, keyed by name.
#[derive(Clone, Default)]
pub struct Handlers {
    by_name: HashMap<&'static str, Arc<dyn ConnectionHandler>>,
}

impl Handlers {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(mut self, name: &'static str, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.by_name.insert(name, handler);
        self
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ConnectionHandler>> {
        self.by_name.get(name).cloned()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_name.keys()).finish()
    }
}
