//! Muster signaling relay server.
//!
//! An axum WebSocket server that brokers WebRTC connections between
//! Muster peers. The relay never inspects an SDP or ICE payload; it
//! only introduces peers by room and forwards their handshake frames
//! until the peers hold a direct data channel.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8000
//! cargo run --bin muster-relay
//!
//! # Run on custom address
//! cargo run --bin muster-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! MUSTER_ADDR=127.0.0.1:8080 cargo run --bin muster-relay
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use muster_relay::config::{RelayCliArgs, RelayConfig};
use muster_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting muster relay server");

    let state = Arc::new(RelayState::with_liveness(
        Duration::from_secs(config.liveness_window_secs),
        Duration::from_secs(config.sweep_period_secs),
    ));

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
