//! Built-in connection handlers.
//!
//! Each handler owns a classified connection until it is done with it:
//! - [`ConnectHandler`] answers `CONNECT` and tunnels to the requested host.
//! - [`ForwardHandler`] forwards absolute-URI requests from proxy clients.
//! - [`DefaultPageHandler`] serves a fixed page to plain HTTP requests.
//! - [`TlsPassthroughHandler`] routes TLS connections on SNI without
//!   terminating them.

mod connect;
mod default_page;
mod forward;
mod head;
mod tls;

pub use connect::{ConnectHandler, DEFAULT_CONNECT_PORT};
pub use default_page::{DefaultPageHandler, DEFAULT_PAGE};
pub use forward::{ForwardHandler, DEFAULT_HTTP_PORT};
pub use head::{read_request_head, HeadRead, RequestHead, DEFAULT_HEAD_TIMEOUT, MAX_HEADERS};
pub use tls::{TlsPassthroughHandler, DEFAULT_TLS_PORT};

use tokio::io::AsyncWriteExt;

use super::conn::Connection;
use super::error::MuxError;

pub(crate) const RESPONSE_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub(crate) const RESPONSE_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub(crate) const RESPONSE_TOO_LARGE: &[u8] =
    b"HTTP/1.1 413 Payload Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub(crate) const RESPONSE_TIMEOUT: &[u8] =
    b"HTTP/1.1 408 Request Timeout\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Write a final response and close the connection.
pub(crate) async fn respond_and_close(
    conn: &mut Connection,
    response: &[u8],
) -> Result<(), MuxError> {
    conn.write_all(response).await?;
    conn.flush().await?;
    let _ = conn.shutdown().await;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Spawn a TCP echo server on loopback, serving every connection until EOF.
    pub(crate) async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// A loopback port with nothing listening on it.
    pub(crate) async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }
}
