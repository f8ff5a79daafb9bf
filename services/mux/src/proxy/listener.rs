//! TCP listener feeding accepted connections to the multiplexer.
//!
//! Each accepted connection gets its own task: the multiplexer classifies
//! it under a sniff timeout, then the selected handler serves it to the end.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::conn::Connection;
use super::error::MuxError;
use super::sniffer::{Multiplexer, Outcome};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time allowed for a client to send enough bytes to classify.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off after an accept error.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time limit for protocol classification.
    pub sniff_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections a matcher recognized.
    pub protocols_matched: AtomicU64,
    /// Connections no matcher recognized.
    pub protocols_unrecognized: AtomicU64,
    /// Connections that did not send enough bytes in time.
    pub sniff_timeouts: AtomicU64,
    /// Connections that ended with an error.
    pub connection_errors: AtomicU64,
}

/// A TCP listener in front of a [`Multiplexer`].
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    mux: Arc<Multiplexer>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(config: ListenerConfig, mux: Arc<Multiplexer>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            sniff_timeout_ms = config.sniff_timeout.as_millis() as u64,
            matchers = ?mux.matcher_names(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            mux,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream).await {
                                stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                                if e.is_defect() {
                                    error!(peer_addr = %peer_addr, error = %e, "Connection failed");
                                } else {
                                    debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                                }
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Classify one connection and hand it to its handler.
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), MuxError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let conn = Connection::from_tcp(stream)?;
        debug!(local_addr = ?conn.local_addr(), "Handling connection");

        let classified = match timeout(self.config.sniff_timeout, self.mux.classify(conn)).await {
            Ok(classified) => classified?,
            Err(_) => {
                self.stats.sniff_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("Sniff timeout, closing");
                return Ok(());
            }
        };

        match &classified.outcome {
            Outcome::Matched { .. } => {
                self.stats.protocols_matched.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Unrecognized { .. } => {
                self.stats
                    .protocols_unrecognized
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        self.mux.dispatch(classified).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::handlers::{DefaultPageHandler, DEFAULT_PAGE};
    use crate::proxy::matcher::{HttpMatcher, ProtocolMatcher};
    use crate::proxy::pipeline::{ConnectionHandler, Handlers, HTTP_REQUEST_HANDLER};
    use crate::proxy::sniffer::MuxConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn page_mux() -> Arc<Multiplexer> {
        let matchers: Vec<Arc<dyn ProtocolMatcher>> = vec![Arc::new(HttpMatcher::new())];
        let page: Arc<dyn ConnectionHandler> = Arc::new(DefaultPageHandler::new());
        Arc::new(Multiplexer::new(
            matchers,
            Handlers::new().register(HTTP_REQUEST_HANDLER, page),
            MuxConfig::default(),
        ))
    }

    async fn spawn_listener(config: ListenerConfig) -> Arc<Listener> {
        let listener = Arc::new(Listener::bind(config, page_mux()).await.unwrap());
        tokio::spawn(Arc::clone(&listener).run());
        listener
    }

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("[::]:8080".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.sniff_timeout, DEFAULT_SNIFF_TIMEOUT);
    }

    #[tokio::test]
    async fn test_serves_classified_connection() {
        let listener = spawn_listener(ListenerConfig::new("127.0.0.1:0".parse().unwrap())).await;
        let addr = listener.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.ends_with(DEFAULT_PAGE.as_bytes()));

        // The task finishes after the response is written
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = listener.stats();
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.protocols_matched.load(Ordering::Relaxed), 1);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_sniff_timeout_closes() {
        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.sniff_timeout = Duration::from_millis(50);
        let listener = spawn_listener(config).await;

        let mut stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        stream.write_all(b"GE").await.unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(listener.stats().sniff_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_max_connections() {
        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.max_connections = 1;
        let listener = spawn_listener(config).await;
        let addr = listener.local_addr().unwrap();

        // Holds the only permit while it waits to be classified
        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(
            listener.stats().connections_rejected.load(Ordering::Relaxed),
            1
        );
    }
}
