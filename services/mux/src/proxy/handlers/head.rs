//! HTTP/1.x request head reading.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use httparse::{Request, Status, EMPTY_HEADER};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::proxy::error::MuxError;

/// Maximum number of headers accepted in a request head.
pub const MAX_HEADERS: usize = 64;

/// Default time a client has to finish its request head.
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_HEAD_CAPACITY: usize = 4096;

/// A parsed request head with owned fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (origin, absolute or authority form).
    pub target: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Length of the head on the wire, including the blank line.
    pub len: usize,
}

impl RequestHead {
    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Whether the client asked for `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .is_some_and(|v| v.trim_ascii().eq_ignore_ascii_case(b"100-continue"))
    }
}

/// Result of reading a request head.
#[derive(Debug)]
pub enum HeadRead {
    /// A complete head, plus whatever the client sent after it.
    Complete { head: RequestHead, rest: Bytes },
    /// The head did not fit in the limit.
    TooLarge,
    /// The bytes are not an HTTP/1.x request.
    Invalid(String),
    /// The client closed before the head was complete.
    Closed { received: usize },
    /// The head was not complete within the time allowed.
    TimedOut,
}

/// Read a request head of at most `limit` bytes from `reader`, giving up
/// after `head_timeout`.
pub async fn read_request_head<R>(
    reader: &mut R,
    limit: usize,
    head_timeout: Duration,
) -> Result<HeadRead, MuxError>
where
    R: AsyncRead + Unpin,
{
    match timeout(head_timeout, read_head(reader, limit)).await {
        Ok(result) => result,
        Err(_) => Ok(HeadRead::TimedOut),
    }
}

async fn read_head<R>(reader: &mut R, limit: usize) -> Result<HeadRead, MuxError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(limit.min(INITIAL_HEAD_CAPACITY));

    loop {
        if !buf.is_empty() {
            match parse_head(&buf) {
                Ok(Some(head)) if head.len > limit => return Ok(HeadRead::TooLarge),
                Ok(Some(head)) => {
                    let rest = buf.split_off(head.len).freeze();
                    return Ok(HeadRead::Complete { head, rest });
                }
                Ok(None) => {}
                Err(e) => return Ok(HeadRead::Invalid(e.to_string())),
            }
        }

        if buf.len() >= limit {
            return Ok(HeadRead::TooLarge);
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Ok(HeadRead::Closed {
                received: buf.len(),
            });
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, httparse::Error> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut req = Request::new(&mut headers);

    let len = match req.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return Ok(None),
    };

    Ok(Some(RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        target: req.path.unwrap_or_default().to_string(),
        version: req.version.unwrap_or(1),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
        len,
    }))
}
