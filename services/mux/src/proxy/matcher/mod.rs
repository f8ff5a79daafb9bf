//! Protocol matchers.
//!
//! A matcher looks at the bytes buffered for a connection so far and decides
//! whether it recognizes the protocol. Matchers are stateless and shared by
//! every connection: `probe` is a pure function of the buffer, and `install`
//! re-derives the detected sub-protocol from the same buffer, so both calls
//! always agree.

mod http;
mod tls;

pub use http::{HttpMatcher, HttpMode, HTTP_METHODS};
pub use tls::{parse_sni, SniResult, TlsMatcher};
pub(crate) use tls::{RECORD_HANDSHAKE, RECORD_HEADER_LEN};

#[cfg(test)]
pub(crate) use tls::client_hello;

use super::error::MuxError;
use super::pipeline::Pipeline;

/// Outcome of probing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The buffer starts with this matcher's protocol.
    Matched,
    /// The buffer can never match, however many bytes follow.
    Rejected,
    /// Not enough bytes to decide.
    NeedMoreData,
}

/// A protocol detection unit.
pub trait ProtocolMatcher: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Decide on the bytes seen so far.
    ///
    /// Must not return [`MatchResult::NeedMoreData`] once the buffer holds at
    /// least [`ProtocolMatcher::max_probe_len`] bytes.
    fn probe(&self, buf: &[u8]) -> MatchResult;

    /// Buffer length at which `probe` is guaranteed to decide.
    fn max_probe_len(&self) -> usize;

    /// Append this protocol's stages to `pipeline`.
    ///
    /// Only called after `probe(buf)` returned [`MatchResult::Matched`].
    fn install(&self, buf: &[u8], pipeline: &mut Pipeline) -> Result<(), MuxError>;
}
