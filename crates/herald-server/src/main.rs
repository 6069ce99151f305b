//! # Herald Server
//!
//! Realtime channel bridge: browser clients subscribe to public, private
//! and presence channels over WebSocket, the application server authorizes
//! them over HTTP, and application events published to Redis are relayed
//! to every subscriber.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Run with a specific config file
//! HERALD_CONFIG=/path/to/herald.toml herald
//!
//! # Override single settings with environment variables
//! HERALD__PORT=8080 HERALD__AUTH__HOST=https://app.example.com herald
//! ```

mod config;
mod handlers;
mod metrics;
mod session;
mod subscriber;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Herald server on {}:{}", config.host, config.port);
    if config.dev_mode {
        tracing::info!("Development mode: logging every authorization and webhook outcome");
    }

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
