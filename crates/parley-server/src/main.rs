//! # parley-server
//!
//! Real-time chat backend.
//!
//! This binary provides:
//! - **Websocket push channel** for live message fan-out, read receipts,
//!   presence, and typing indicators
//! - **SQLite-backed conversation store** (direct and group chats, full
//!   message history, membership and admin state)
//! - **REST API** (axum) for conversation/group management and history
//!   fetches
//!
//! Authentication is out of scope: an upstream gateway authenticates users
//! and passes the acting user id in the `x-user-id` header.

mod api;
mod config;
mod engine;
mod error;
mod hub;
mod locks;
mod presence;
mod session;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::config::ServerConfig;
use crate::engine::ChatEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing respects the RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(instance = %config.instance_name, ?config, "Loaded configuration");

    let db = Database::open_at(&config.db_path)?;
    info!(path = %config.db_path.display(), "Database ready");

    let engine = ChatEngine::new(db, config.clone());

    tokio::select! {
        result = api::serve(engine, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
