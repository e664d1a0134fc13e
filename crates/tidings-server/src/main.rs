//! # tidings-server
//!
//! Real-time direct and group messaging for the platform.
//!
//! This binary provides:
//! - **Durable message log** in SQLite, the single source of truth
//! - **Rolling cache** of the newest ten messages per conversation
//!   (in-process, or Redis when `REDIS_URL` is set)
//! - **Broadcast bus** so live delivery works across server processes
//! - **WebSocket transport** with personal and group rooms
//! - **REST API** (axum) for sending, paging, read state, inbox and groups

mod api;
mod bus;
mod cache;
mod config;
mod directory;
mod error;
mod housekeeping;
mod inbox;
mod message_log;
mod service;
mod signer;
#[cfg(test)]
mod testkit;
mod transport;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidings_shared::constants::DELIVERY_TOPIC;
use tidings_store::Database;

use crate::api::AppState;
use crate::bus::{BroadcastBus, LocalBus, RedisBus};
use crate::cache::{MemoryCache, RedisCache, RollingCache};
use crate::config::ServerConfig;
use crate::housekeeping::Sweeper;
use crate::message_log::MessageLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tidings_server=debug")),
        )
        .init();

    info!("Starting tidings server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the message log
    // -----------------------------------------------------------------------
    let mut db = Database::open_at(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    db.set_broadcast_counts_unread(config.broadcast_counts_unread);
    let log = MessageLog::new(db, config.read_timeout);

    // -----------------------------------------------------------------------
    // 4. Cache and bus backends
    // -----------------------------------------------------------------------
    let cache: Arc<dyn RollingCache>;
    let bus: Arc<dyn BroadcastBus>;
    match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
            cache = Arc::new(
                RedisCache::connect(client.clone())
                    .await
                    .context("connecting rolling cache to Redis")?,
            );
            bus = Arc::new(
                RedisBus::connect(client)
                    .await
                    .context("connecting delivery bus to Redis")?,
            );
            info!("Using Redis for rolling cache and delivery bus");
        }
        None => {
            cache = Arc::new(MemoryCache::new());
            bus = Arc::new(LocalBus::new());
            info!("Using in-process rolling cache and delivery bus");
        }
    }

    let config = Arc::new(config);
    let app_state = AppState::assemble(config.clone(), log, cache, bus.clone());

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------
    let events = bus
        .subscribe(DELIVERY_TOPIC)
        .await
        .context("subscribing to delivery bus")?;
    let _dispatcher = transport::spawn_dispatcher(events, app_state.hub.clone());

    let sweeper = Sweeper::start(app_state.messenger.windows().clone(), config.sweep_interval);

    // -----------------------------------------------------------------------
    // 6. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let outcome = tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    sweeper.stop().await;
    info!("tidings server stopped");
    outcome
}
