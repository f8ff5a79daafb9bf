//! Protocol-sniffing connection multiplexer.
//!
//! This module provides:
//! - Protocol matchers for HTTP (plain, CONNECT, proxy-style) and TLS
//! - The multiplexer that classifies connections without losing bytes
//! - Built-in handlers and the tunnel relay they share
//! - TCP listener management
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Multiplexer -> Matcher.install -> Pipeline
//!                           |                               |
//!                      sniff buffer (replayed)          Handler -> Relay -> Upstream
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{standard_multiplexer, Listener, ListenerConfig, StandardOptions};
//!
//! let mux = Arc::new(standard_multiplexer(&StandardOptions::default()));
//! let config = ListenerConfig::new("[::]:8080".parse()?);
//! let listener = Arc::new(Listener::bind(config, mux).await?);
//! listener.run().await?;
//! ```

mod conn;
mod error;
pub mod handlers;
mod listener;
pub mod matcher;
mod pipeline;
mod relay;
mod sniffer;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

pub use conn::{AsyncStream, Connection, Endpoint, Replay};
pub use error::MuxError;
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS, DEFAULT_SNIFF_TIMEOUT,
};
pub use matcher::{HttpMatcher, HttpMode, MatchResult, ProtocolMatcher, TlsMatcher};
pub use pipeline::{
    ConnectionHandler, Handlers, Pipeline, Stage, DEFAULT_AGGREGATOR_MAX_BYTES,
    HTTP_CONNECT_HANDLER, HTTP_PROXY_HANDLER, HTTP_REQUEST_HANDLER, TLS_PASSTHROUGH_HANDLER,
};
pub use relay::{Relay, RelayStats, RELAY_BUFFER_SIZE};
pub use sniffer::{
    Classified, Multiplexer, MuxConfig, Outcome, RejectReason, DEFAULT_MAX_SNIFF_BYTES,
};
pub use upstream::{connect_upstream, DEFAULT_CONNECT_TIMEOUT};

use handlers::{
    ConnectHandler, DefaultPageHandler, ForwardHandler, TlsPassthroughHandler,
    DEFAULT_HEAD_TIMEOUT, DEFAULT_TLS_PORT,
};

/// Settings for [`standard_multiplexer`].
#[derive(Debug, Clone)]
pub struct StandardOptions {
    /// Aggregator limit for plain HTTP requests.
    pub aggregator_max_bytes: usize,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
    /// Time a classified client has to finish its request head or ClientHello.
    pub head_timeout: Duration,
    /// Register the TLS matcher and passthrough handler.
    pub tls_passthrough: bool,
    /// Upstream port for TLS passthrough.
    pub tls_upstream_port: u16,
    /// Multiplexer settings.
    pub mux: MuxConfig,
}

impl Default for StandardOptions {
    fn default() -> Self {
        Self {
            aggregator_max_bytes: DEFAULT_AGGREGATOR_MAX_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
            tls_passthrough: false,
            tls_upstream_port: DEFAULT_TLS_PORT,
            mux: MuxConfig::default(),
        }
    }
}

/// Build a multiplexer with the built-in matchers and handlers.
///
/// The HTTP matcher always comes first; the TLS matcher follows when
/// passthrough is enabled.
pub fn standard_multiplexer(options: &StandardOptions) -> Multiplexer {
    let mut matchers: Vec<Arc<dyn ProtocolMatcher>> = vec![Arc::new(
        HttpMatcher::with_aggregator_limit(options.aggregator_max_bytes),
    )];

    let mut handlers = Handlers::new()
        .register(
            HTTP_REQUEST_HANDLER,
            Arc::new(
                DefaultPageHandler::with_head_limit(options.aggregator_max_bytes)
                    .with_head_timeout(options.head_timeout),
            ),
        )
        .register(
            HTTP_CONNECT_HANDLER,
            Arc::new(
                ConnectHandler::with_connect_timeout(options.connect_timeout)
                    .with_head_timeout(options.head_timeout),
            ),
        )
        .register(
            HTTP_PROXY_HANDLER,
            Arc::new(
                ForwardHandler::with_connect_timeout(options.connect_timeout)
                    .with_head_timeout(options.head_timeout),
            ),
        );

    if options.tls_passthrough {
        matchers.push(Arc::new(TlsMatcher::new()));
        handlers = handlers.register(
            TLS_PASSTHROUGH_HANDLER,
            Arc::new(
                TlsPassthroughHandler::new()
                    .with_upstream_port(options.tls_upstream_port)
                    .with_connect_timeout(options.connect_timeout)
                    .with_hello_timeout(options.head_timeout),
            ),
        );
    }

    Multiplexer::new(matchers, handlers, options.mux.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_multiplexer() {
        let mux = standard_multiplexer(&StandardOptions::default());
        assert_eq!(mux.matcher_names(), vec!["http"]);

        let mux = standard_multiplexer(&StandardOptions {
            tls_passthrough: true,
            ..StandardOptions::default()
        });
        assert_eq!(mux.matcher_names(), vec!["http", "tls"]);
    }
}
