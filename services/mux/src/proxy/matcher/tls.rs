//! TLS matcher and ClientHello SNI parsing.
//!
//! Detection only looks at the record header. SNI extraction is used by the
//! passthrough handler once the full ClientHello record has been read.

use super::{MatchResult, ProtocolMatcher};
use crate::proxy::error::MuxError;
use crate::proxy::pipeline::{Pipeline, Stage, TLS_PASSTHROUGH_HANDLER};

/// TLS record type for handshake messages.
pub(crate) const RECORD_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for server_name.
const EXT_SERVER_NAME: u16 = 0x0000;

/// Length of a TLS record header.
pub(crate) const RECORD_HEADER_LEN: usize = 5;

/// Matcher for TLS connections (SSL 3.0 through TLS 1.3 record layer).
#[derive(Debug, Clone, Default)]
pub struct TlsMatcher;

impl TlsMatcher {
    /// Create a TLS matcher.
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolMatcher for TlsMatcher {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn probe(&self, buf: &[u8]) -> MatchResult {
        match buf {
            [] => MatchResult::NeedMoreData,
            [first, ..] if *first != RECORD_HANDSHAKE => MatchResult::Rejected,
            [_] | [_, _] => MatchResult::NeedMoreData,
            [_, 0x03, minor, ..] if *minor <= 0x04 => MatchResult::Matched,
            _ => MatchResult::Rejected,
        }
    }

    fn max_probe_len(&self) -> usize {
        3
    }

    fn install(&self, buf: &[u8], pipeline: &mut Pipeline) -> Result<(), MuxError> {
        if self.probe(buf) != MatchResult::Matched {
            return Err(MuxError::Invariant {
                matcher: self.name(),
                reason: "install called on a buffer that does not match".to_string(),
            });
        }
        pipeline
            .add_last(Stage::TlsPassthrough)
            .hand_off(TLS_PASSTHROUGH_HANDLER);
        Ok(())
    }
}

/// Result of SNI extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Hostname, lowercased with any trailing dot removed.
    Found(String),
    /// ClientHello without a server_name extension.
    NoSni,
    /// Not a TLS handshake record carrying a ClientHello.
    NotTls,
    /// Truncated or inconsistent ClientHello.
    Malformed,
}

/// Parse SNI from a buffer starting with a TLS record.
///
/// Layout after the 5-byte record header and 4-byte handshake header:
/// version (2), random (32), session id (1 + n), cipher suites (2 + n),
/// compression methods (1 + n), extensions (2 + n).
pub fn parse_sni(data: &[u8]) -> SniResult {
    if data.len() < RECORD_HEADER_LEN + 4 {
        return SniResult::Malformed;
    }
    if data[0] != RECORD_HANDSHAKE || data[RECORD_HEADER_LEN] != HANDSHAKE_CLIENT_HELLO {
        return SniResult::NotTls;
    }

    let hello = &data[RECORD_HEADER_LEN + 4..];
    let mut pos = 34;

    let Some(&session_id_len) = hello.get(pos) else {
        return SniResult::Malformed;
    };
    pos += 1 + session_id_len as usize;

    let Some(cipher_suites_len) = read_u16(hello, pos) else {
        return SniResult::Malformed;
    };
    pos += 2 + cipher_suites_len as usize;

    let Some(&compression_len) = hello.get(pos) else {
        return SniResult::Malformed;
    };
    pos += 1 + compression_len as usize;

    let Some(extensions_len) = read_u16(hello, pos) else {
        return SniResult::NoSni;
    };
    pos += 2;
    let extensions_end = (pos + extensions_len as usize).min(hello.len());

    while pos + 4 <= extensions_end {
        let (Some(ext_type), Some(ext_len)) = (read_u16(hello, pos), read_u16(hello, pos + 2))
        else {
            return SniResult::Malformed;
        };
        pos += 4;
        let ext_end = (pos + ext_len as usize).min(hello.len());

        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(&hello[pos..ext_end]);
        }
        pos = ext_end;
    }

    SniResult::NoSni
}

/// Parse the server_name extension body: list length (2), then entries of
/// name type (1), name length (2), name.
fn parse_server_name(data: &[u8]) -> SniResult {
    let Some(list_len) = read_u16(data, 0) else {
        return SniResult::Malformed;
    };
    let list_end = 2 + list_len as usize;
    if data.len() < list_end {
        return SniResult::Malformed;
    }

    let mut pos = 2;
    while pos + 3 <= list_end {
        let name_type = data[pos];
        let Some(name_len) = read_u16(data, pos + 1) else {
            return SniResult::Malformed;
        };
        pos += 3;
        let name_end = pos + name_len as usize;
        if name_end > data.len() {
            return SniResult::Malformed;
        }

        if name_type == 0 {
            return match std::str::from_utf8(&data[pos..name_end]) {
                Ok(hostname) => {
                    SniResult::Found(hostname.to_lowercase().trim_end_matches('.').to_string())
                }
                Err(_) => SniResult::Malformed,
            };
        }
        pos = name_end;
    }

    SniResult::NoSni
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Build a minimal ClientHello record carrying `server_name`.
#[cfg(test)]
pub(crate) fn client_hello(server_name: &str) -> Vec<u8> {
    let name = server_name.as_bytes();

    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(0);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0u8; 32]);
    body.push(0); // session id
    body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // one cipher suite
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
