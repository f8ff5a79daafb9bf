//! proxyhub
//!
//! Single-port proxy front end.
//!
//! This service:
//! - Accepts TCP connections on one listener
//! - Sniffs the first bytes of each connection to detect the protocol
//! - Tunnels HTTP CONNECT requests and forwards proxy-style HTTP requests
//! - Serves a default page to plain HTTP visitors
//! - Optionally passes TLS through to the host named in the SNI

use std::sync::Arc;

use anyhow::Result;
use proxyhub_mux::{standard_multiplexer, Config, Listener};
use proxyhub_networking::network_info_list;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PROXYHUB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting proxyhub");
    info!(
        listen_addr = %config.listen_addr,
        max_connections = config.max_connections,
        fallback = ?config.fallback,
        tls_passthrough = config.tls_passthrough,
        "Configuration loaded"
    );

    for interface in network_info_list() {
        info!(
            interface = %interface.interface_name,
            ip = %interface.ip,
            "Local address"
        );
    }

    let mux = Arc::new(standard_multiplexer(&config.standard_options()));
    let listener = match Listener::bind(config.listener_config(), mux).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(
                bind_addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            return Err(e.into());
        }
    };

    tokio::select! {
        result = Arc::clone(&listener).run() => {
            if let Err(e) = result {
                error!(error = %e, "Listener error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
