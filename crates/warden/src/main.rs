//! # Warden - Gatehouse Logic Engine
//!
//! The brain of Gatehouse. Screens join requests with challenge-response
//! verification, moderates posted images, and applies per-group mute policy.
//!
//! ## Architecture
//! ```text
//! Platform Adapter → Warden → Platform Adapter
//!                      ↓
//!          Redis (hot state) + sqlite (policy & audit)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod admin;
mod admission;
mod cache;
mod challenge;
mod config;
mod coordinator;
mod gateway;
mod moderation;
mod notify;
mod policy;
mod ratelimit;
mod routes;
mod state;
mod store;
mod tasks;

use config::AppConfig;
use gateway::{PlatformGateway, RelayGateway};
use state::AppState;

/// Gatehouse Warden - join screening and moderation engine
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/warden.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Sqlite database path (overrides config)
    #[arg(long, env = "WARDEN_DB")]
    pub db_path: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    pub listen: Option<String>,

    /// Platform adapter base URL (overrides config)
    #[arg(long, env = "RELAY_URL")]
    pub relay_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🛡 Starting Gatehouse Warden v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!("📋 Configuration loaded from {}", args.config);

    // The platform adapter is the only party that speaks the chat platform's
    // wire format; everything here goes through the gateway interface.
    let gateway: Arc<dyn PlatformGateway> = Arc::new(RelayGateway::new(config.relay_url.clone()));

    // Initialize application state
    let state = AppState::new(config, gateway).await?;
    info!(
        "✅ Stores ready: {} / {}",
        state.config.redis_url, state.config.db_path
    );

    // Build router
    let listen_addr = state.config.listen_addr.clone();
    let app = routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!("🚀 Warden listening on {}", listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("🛑 Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("👋 Warden shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
