//! Protocol multiplexer.
//!
//! The multiplexer reads the first bytes of a connection into a sniff buffer,
//! asks every registered matcher in priority order whether it recognizes
//! them, and hands the connection (with the sniffed bytes replayed) to the
//! handler named by the winning matcher's pipeline. It is not involved in
//! the connection after that.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error};

use super::conn::Connection;
use super::error::MuxError;
use super::matcher::{MatchResult, ProtocolMatcher};
use super::pipeline::{Handlers, Pipeline};

/// Default ceiling on bytes buffered before giving up on classification.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

/// Initial sniff buffer capacity.
const INITIAL_SNIFF_CAPACITY: usize = 1024;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Bytes buffered before an undecided connection counts as unrecognized.
    pub max_sniff_bytes: usize,
    /// Handler for unrecognized connections; `None` closes them.
    pub fallback: Option<&'static str>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_sniff_bytes: DEFAULT_MAX_SNIFF_BYTES,
            fallback: None,
        }
    }
}

/// Result of running the matchers over one buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Matcher at this registry index matched.
    Matched(usize),
    /// Every matcher rejected the buffer.
    AllRejected,
    /// At least one matcher needs more bytes.
    Pending,
}

/// Why a connection could not be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Every matcher rejected the buffered bytes.
    AllRejected,
    /// The client closed before a decision was reached.
    Eof,
    /// The sniff buffer reached its ceiling without a decision.
    SniffLimit,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AllRejected => f.write_str("no matcher accepted the connection"),
            RejectReason::Eof => f.write_str("connection closed before classification"),
            RejectReason::SniffLimit => f.write_str("sniff limit reached"),
        }
    }
}

/// Classification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A matcher recognized the protocol and installed its pipeline.
    Matched {
        matcher: &'static str,
        pipeline: Pipeline,
    },
    /// No matcher recognized the protocol.
    Unrecognized { reason: RejectReason },
}

/// A connection after classification.
///
/// The connection replays every sniffed byte before reading from the socket.
#[derive(Debug)]
pub struct Classified {
    /// Connection to hand over.
    pub conn: Connection,
    /// What the matchers decided.
    pub outcome: Outcome,
    /// Number of bytes sniffed.
    pub sniffed: usize,
}

/// Protocol-sniffing connection multiplexer.
pub struct Multiplexer {
    matchers: Vec<Arc<dyn ProtocolMatcher>>,
    handlers: Handlers,
    config: MuxConfig,
}

impl Multiplexer {
    /// Create a multiplexer. `matchers` is in priority order.
    pub fn new(
        matchers: Vec<Arc<dyn ProtocolMatcher>>,
        handlers: Handlers,
        config: MuxConfig,
    ) -> Self {
        Self {
            matchers,
            handlers,
            config,
        }
    }

    /// Registered matcher names, in priority order.
    pub fn matcher_names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    /// Run the matchers over `buf`.
    ///
    /// `rejected` holds one flag per matcher, sized by `classify`. Matchers
    /// flagged as rejected are skipped: a prefix that failed cannot pass once
    /// more bytes arrive.
    fn decide(&self, buf: &[u8], rejected: &mut [bool]) -> Decision {
        let flags = self.matchers.iter().zip(rejected.iter_mut());
        for (index, (matcher, rejected)) in flags.enumerate() {
            if *rejected {
                continue;
            }
            match matcher.probe(buf) {
                MatchResult::Matched => return Decision::Matched(index),
                MatchResult::Rejected => *rejected = true,
                MatchResult::NeedMoreData => {}
            }
        }

        if rejected.iter().all(|r| *r) {
            Decision::AllRejected
        } else {
            Decision::Pending
        }
    }

    /// Read from `conn` until a matcher decides.
    pub async fn classify(&self, mut conn: Connection) -> Result<Classified, MuxError> {
        let mut buf = BytesMut::with_capacity(INITIAL_SNIFF_CAPACITY);
        let mut rejected = vec![false; self.matchers.len()];

        let reason = loop {
            let n = conn.read_buf(&mut buf).await?;
            if n == 0 {
                break RejectReason::Eof;
            }

            match self.decide(&buf, &mut rejected) {
                Decision::Matched(index) => {
                    let matcher = &self.matchers[index];
                    let mut pipeline = Pipeline::new();
                    matcher.install(&buf, &mut pipeline)?;
                    debug!(
                        matcher = matcher.name(),
                        pipeline = %pipeline,
                        sniffed = buf.len(),
                        "Protocol matched"
                    );
                    return Ok(classified(
                        conn,
                        buf.freeze(),
                        Outcome::Matched {
                            matcher: matcher.name(),
                            pipeline,
                        },
                    ));
                }
                Decision::AllRejected => break RejectReason::AllRejected,
                Decision::Pending => {
                    self.check_undecided(&buf, &rejected)?;
                    if buf.len() >= self.config.max_sniff_bytes {
                        break RejectReason::SniffLimit;
                    }
                }
            }
        };

        debug!(
            peer_addr = %conn.peer(),
            sniffed = buf.len(),
            reason = %reason,
            "Protocol unrecognized"
        );
        Ok(classified(
            conn,
            buf.freeze(),
            Outcome::Unrecognized { reason },
        ))
    }

    /// Fail if a matcher is still undecided past its declared probe length.
    fn check_undecided(&self, buf: &[u8], rejected: &[bool]) -> Result<(), MuxError> {
        let overdue = self
            .matchers
            .iter()
            .zip(rejected)
            .find(|(matcher, rejected)| !**rejected && buf.len() >= matcher.max_probe_len());

        match overdue {
            Some((matcher, _)) => {
                error!(
                    matcher = matcher.name(),
                    sniffed = buf.len(),
                    max_probe_len = matcher.max_probe_len(),
                    "Matcher undecided past its probe length"
                );
                Err(MuxError::Invariant {
                    matcher: matcher.name(),
                    reason: format!(
                        "still undecided after {} bytes (declared {})",
                        buf.len(),
                        matcher.max_probe_len()
                    ),
                })
            }
            None => Ok(()),
        }
    }

    /// Hand a classified connection to its handler.
    ///
    /// Unrecognized connections go to the fallback handler if one is
    /// configured and are shut down otherwise.
    pub async fn dispatch(&self, classified: Classified) -> Result<(), MuxError> {
        let Classified { mut conn, outcome, .. } = classified;

        let (name, pipeline) = match outcome {
            Outcome::Matched { pipeline, .. } => {
                let Some(name) = pipeline.handler() else {
                    return Err(MuxError::NoHandler("<unnamed>".to_string()));
                };
                (name, pipeline)
            }
            Outcome::Unrecognized { reason } => match self.config.fallback {
                Some(name) => {
                    debug!(handler = name, reason = %reason, "Dispatching to fallback handler");
                    (name, Pipeline::new())
                }
                None => {
                    let _ = conn.shutdown().await;
                    return Ok(());
                }
            },
        };

        let Some(handler) = self.handlers.get(name) else {
            error!(handler = name, "Pipeline names an unregistered handler");
            return Err(MuxError::NoHandler(name.to_string()));
        };
        handler.handle(conn, pipeline).await
    }

    /// Classify and dispatch a connection.
    pub async fn serve(&self, conn: Connection) -> Result<(), MuxError> {
        let classified = self.classify(conn).await?;
        self.dispatch(classified).await
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("matchers", &self.matcher_names())
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish()
    }
}

fn classified(conn: Connection, sniffed: Bytes, outcome: Outcome) -> Classified {
    let len = sniffed.len();
    Classified {
        conn: conn.replay(sniffed),
        outcome,
        sniffed: len,
    }
}
