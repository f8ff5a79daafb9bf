//! Error types for multiplexing and tunneling.

use std::io;

use proxyhub_networking::NetworkError;
use thiserror::Error;

/// Errors that can occur while classifying or serving a connection.
#[derive(Debug, Error)]
pub enum MuxError {
    /// I/O error on the client or upstream connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A pipeline named a handler that is not registered.
    #[error("no handler registered for {0:?}")]
    NoHandler(String),

    /// A matcher broke its contract (install without a match).
    #[error("matcher {matcher} invariant violated: {reason}")]
    Invariant {
        matcher: &'static str,
        reason: String,
    },

    /// The client sent a request the handler cannot act on.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Connecting to the upstream target failed.
    #[error("upstream {target} unavailable: {reason}")]
    Upstream { target: String, reason: String },

    /// Target address could not be parsed.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl MuxError {
    /// Whether this error indicates a server-side defect rather than bad input.
    pub fn is_defect(&self) -> bool {
        matches!(self, MuxError::NoHandler(_) | MuxError::Invariant { .. })
    }
}
