//! Tunnel relay between a client connection and an upstream target.
//!
//! Used for CONNECT tunnels, TLS passthrough and forwarded proxy requests
//! once the upstream connection is open. Each direction copies chunks in
//! order; the two directions run concurrently.
//!
//! Closing rules:
//! - A side that reaches EOF is closed, and its peer is shut down after the
//!   writes already queued to it are flushed.
//! - A chunk read while the peer is closed is dropped with a warning. The
//!   relay never buffers for a dead peer.
//! - An I/O error closes the side it surfaced on; the opposite direction
//!   observes the close and finishes the teardown.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::conn::{Connection, Endpoint};

/// Size of the per-direction copy buffer.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Byte counts for a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes written to the target.
    pub to_target: u64,
    /// Bytes written to the client.
    pub to_client: u64,
    /// Chunks dropped because their destination was closed.
    pub dropped_chunks: u64,
}

/// A client/target connection pair.
pub struct Relay {
    client: Connection,
    target: Connection,
}

impl Relay {
    /// Pair `client` with `target`.
    pub fn new(client: Connection, target: Connection) -> Self {
        Self { client, target }
    }

    /// Relay until both directions are done.
    pub async fn run(self) -> RelayStats {
        let client_side = Side::new("client", self.client.peer());
        let target_side = Side::new("target", self.target.peer());

        let (client_read, client_write) = tokio::io::split(self.client);
        let (target_read, target_write) = tokio::io::split(self.target);

        let (upstream, downstream) = tokio::join!(
            pump(client_read, &client_side, target_write, &target_side),
            pump(target_read, &target_side, client_write, &client_side),
        );

        let stats = RelayStats {
            to_target: upstream.bytes,
            to_client: downstream.bytes,
            dropped_chunks: upstream.dropped + downstream.dropped,
        };
        debug!(
            client_addr = %client_side.addr,
            target_addr = %target_side.addr,
            to_target = stats.to_target,
            to_client = stats.to_client,
            dropped_chunks = stats.dropped_chunks,
            "Tunnel closed"
        );
        stats
    }
}

/// Open/closed state of one end of the tunnel.
struct Side {
    role: &'static str,
    addr: Endpoint,
    open: watch::Sender<bool>,
}

impl Side {
    fn new(role: &'static str, addr: Endpoint) -> Self {
        let (open, _) = watch::channel(true);
        Self { role, addr, open }
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    fn close(&self) {
        self.open.send_replace(false);
    }

    /// Resolves once the side is closed.
    fn closed(&self) -> impl Future<Output = ()> + '_ {
        let mut rx = self.open.subscribe();
        async move {
            let _ = rx.wait_for(|open| !*open).await;
        }
    }
}

/// Result of one direction.
#[derive(Debug, Default)]
struct Transfer {
    bytes: u64,
    dropped: u64,
}

/// Copy from `src` to `dst` until `src` closes.
async fn pump<R, W>(mut reader: R, src: &Side, mut writer: W, dst: &Side) -> Transfer
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transfer = Transfer::default();

    // Empty flush signals readiness to the side we write to.
    if let Err(e) = writer.flush().await {
        fail(dst, src, &e);
    }

    let src_closed = src.closed();
    tokio::pin!(src_closed);
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            biased;
            _ = &mut src_closed => break,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(side = src.role, addr = %src.addr, "Tunnel side closed");
                src.close();
                break;
            }
            Ok(n) => {
                if !dst.is_open() {
                    warn!(
                        side = dst.role,
                        addr = %dst.addr,
                        bytes = n,
                        "Proxy peer inactive, dropping chunk"
                    );
                    transfer.dropped += 1;
                    continue;
                }
                match write_chunk(&mut writer, &buf[..n]).await {
                    Ok(()) => transfer.bytes += n as u64,
                    Err(e) => {
                        fail(dst, src, &e);
                        let _ = writer.shutdown().await;
                        transfer.dropped += 1;
                    }
                }
            }
            Err(e) => {
                fail(src, dst, &e);
                break;
            }
        }
    }

    if dst.is_open() {
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
        dst.close();
    }

    transfer
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

/// Log an error that surfaced on `failed` and close it.
fn fail(failed: &Side, peer: &Side, e: &io::Error) {
    error!(
        side = failed.role,
        addr = %failed.addr,
        peer = %peer.addr,
        error = %e,
        "Tunnel error"
    );
    failed.close();
}
