//! Upstream dialing for tunnels and forwarded requests.

use std::time::Duration;

use proxyhub_networking::NetAddress;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::conn::Connection;
use super::error::MuxError;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Open a TCP connection to `target`.
///
/// `target` must carry a port; callers fill in protocol defaults first.
pub async fn connect_upstream(
    target: &NetAddress,
    connect_timeout: Duration,
) -> Result<Connection, MuxError> {
    let Some(port) = target.port else {
        return Err(MuxError::Upstream {
            target: target.to_string(),
            reason: "no port".to_string(),
        });
    };

    let stream = match timeout(connect_timeout, TcpStream::connect((target.host.as_str(), port)))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(upstream = %target, error = %e, "Upstream connect failed");
            return Err(MuxError::Upstream {
                target: target.to_string(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            warn!(
                upstream = %target,
                timeout_ms = connect_timeout.as_millis() as u64,
                "Upstream connect timeout"
            );
            return Err(MuxError::Upstream {
                target: target.to_string(),
                reason: "connect timeout".to_string(),
            });
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!(upstream = %target, error = %e, "Failed to set TCP_NODELAY");
    }

    let conn = Connection::from_tcp(stream)?;
    debug!(upstream = %target, upstream_addr = %conn.peer(), "Connected to upstream");
    Ok(conn)
}
