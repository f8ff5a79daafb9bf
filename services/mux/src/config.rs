//! Service configuration.
//!
//! Everything comes from `PROXYHUB_*` environment variables; unset variables
//! fall back to defaults and numeric values are clamped to sane ranges.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::proxy::{
    ListenerConfig, MuxConfig, StandardOptions, DEFAULT_AGGREGATOR_MAX_BYTES,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_SNIFF_BYTES, HTTP_REQUEST_HANDLER,
};

/// What to do with connections no matcher recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Close the connection.
    Close,
    /// Serve the default page.
    DefaultPage,
}

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Time a client has to send enough bytes for classification.
    pub sniff_timeout: Duration,

    /// Time a classified client has to finish its request head.
    pub head_timeout: Duration,

    /// Bytes buffered before an undecided connection is unrecognized.
    pub max_sniff_bytes: usize,

    /// Aggregator limit for plain HTTP requests.
    pub aggregator_max_bytes: usize,

    /// Upstream connect timeout.
    pub connect_timeout: Duration,

    /// Handling of unrecognized connections.
    pub fallback: Fallback,

    /// Route TLS connections to their SNI host.
    pub tls_passthrough: bool,

    /// Upstream port for TLS passthrough.
    pub tls_upstream_port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("PROXYHUB_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("PROXYHUB_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8080).")?;

        let max_connections: usize = lookup("PROXYHUB_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYHUB_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let sniff_timeout_ms: u64 = lookup("PROXYHUB_SNIFF_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYHUB_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);
        let sniff_timeout = Duration::from_millis(sniff_timeout_ms.max(50));

        let head_timeout_ms: u64 = lookup("PROXYHUB_HEAD_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYHUB_HEAD_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(sniff_timeout_ms);
        let head_timeout = Duration::from_millis(head_timeout_ms.max(50));

        let max_sniff_bytes: usize = lookup("PROXYHUB_MAX_SNIFF_BYTES")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYHUB_MAX_SNIFF_BYTES must be an integer.")?
            .unwrap_or(DEFAULT_MAX_SNIFF_BYTES)
            .clamp(64, 65536);

        let aggregator_max_bytes: usize = lookup("PROXYHUB_AGGREGATOR_MAX_BYTES")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYHUB_AGGREGATOR_MAX_BYTES must be an integer.")?
            .unwrap_or(DEFAULT_AGGREGATOR_MAX_BYTES)
            .max(1024);

        let connect_timeout_ms: u64 = lookup("PROXYHUB_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYHUB_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(50));

        let fallback = match lookup("PROXYHUB_FALLBACK").as_deref() {
            None | Some("close") => Fallback::Close,
            Some("default-page") => Fallback::DefaultPage,
            Some(other) => bail!(
                "PROXYHUB_FALLBACK must be \"close\" or \"default-page\", got {:?}.",
                other
            ),
        };

        let tls_passthrough = lookup("PROXYHUB_TLS_PASSTHROUGH")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let tls_upstream_port: u16 = lookup("PROXYHUB_TLS_UPSTREAM_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYHUB_TLS_UPSTREAM_PORT must be a port number.")?
            .unwrap_or(443);

        let log_level = lookup("PROXYHUB_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            max_connections,
            sniff_timeout,
            head_timeout,
            max_sniff_bytes,
            aggregator_max_bytes,
            connect_timeout,
            fallback,
            tls_passthrough,
            tls_upstream_port,
            log_level,
        })
    }

    /// Listener settings.
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen_addr);
        config.max_connections = self.max_connections;
        config.sniff_timeout = self.sniff_timeout;
        config
    }

    /// Matcher and handler settings.
    pub fn standard_options(&self) -> StandardOptions {
        StandardOptions {
            aggregator_max_bytes: self.aggregator_max_bytes,
            connect_timeout: self.connect_timeout,
            head_timeout: self.head_timeout,
            tls_passthrough: self.tls_passthrough,
            tls_upstream_port: self.tls_upstream_port,
            mux: MuxConfig {
                max_sniff_bytes: self.max_sniff_bytes,
                fallback: match self.fallback {
                    Fallback::Close => None,
                    Fallback::DefaultPage => Some(HTTP_REQUEST_HANDLER),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.sniff_timeout, Duration::from_secs(5));
        assert_eq!(config.head_timeout, Duration::from_secs(5));
        assert_eq!(config.max_sniff_bytes, DEFAULT_MAX_SNIFF_BYTES);
        assert_eq!(config.aggregator_max_bytes, DEFAULT_AGGREGATOR_MAX_BYTES);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.fallback, Fallback::Close);
        assert!(!config.tls_passthrough);
        assert_eq!(config.tls_upstream_port, 443);
        assert_eq!(config.log_level, "info");

        let options = config.standard_options();
        assert!(options.mux.fallback.is_none());
    }

    #[test]
    fn test_overrides_and_clamps() {
        let config = config_from(&[
            ("PROXYHUB_LISTEN_ADDR", "127.0.0.1:9000"),
            ("PROXYHUB_SNIFF_TIMEOUT_MS", "1"),
            ("PROXYHUB_MAX_SNIFF_BYTES", "1000000"),
            ("PROXYHUB_FALLBACK", "default-page"),
            ("PROXYHUB_TLS_PASSTHROUGH", "TRUE"),
            ("PROXYHUB_TLS_UPSTREAM_PORT", "8443"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.sniff_timeout, Duration::from_millis(50));
        assert_eq!(config.head_timeout, Duration::from_millis(50));
        assert_eq!(config.max_sniff_bytes, 65536);
        assert_eq!(config.fallback, Fallback::DefaultPage);
        assert!(config.tls_passthrough);

        let options = config.standard_options();
        assert_eq!(options.mux.fallback, Some(HTTP_REQUEST_HANDLER));
        assert_eq!(options.tls_upstream_port, 8443);
        assert_eq!(config.listener_config().bind_addr, config.listen_addr);
    }

    #[test]
    fn test_head_timeout_override() {
        let config = config_from(&[("PROXYHUB_HEAD_TIMEOUT_MS", "250")]).unwrap();
        assert_eq!(config.head_timeout, Duration::from_millis(250));
        assert_eq!(config.standard_options().head_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values() {
        assert!(config_from(&[("PROXYHUB_LISTEN_ADDR", "nowhere")]).is_err());
        assert!(config_from(&[("PROXYHUB_MAX_CONNECTIONS", "many")]).is_err());
        assert!(config_from(&[("PROXYHUB_FALLBACK", "redirect")]).is_err());
        assert!(config_from(&[("PROXYHUB_TLS_UPSTREAM_PORT", "70000")]).is_err());
    }
}
