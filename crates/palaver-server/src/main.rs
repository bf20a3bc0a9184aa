//! # palaver-server
//!
//! Real-time direct-messaging server.
//!
//! This binary provides:
//! - **WebSocket sessions** carrying typing, messages, edits, reactions and
//!   read receipts between two users, with multi-connection presence
//! - **REST API** (axum) for profiles, the user directory, friend requests,
//!   blocks, history, image uploads and an admin surface
//! - **SQLite persistence** through `palaver-store`
//! - **Per-IP and per-connection rate limiting**

mod api;
mod auth;
mod blob_store;
mod config;
mod db;
mod error;
mod hub;
mod presence;
mod rate_limit;
mod router;
mod session;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use palaver_store::Database;

use crate::api::AppState;
use crate::auth::TokenAuthority;
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::db::Db;
use crate::hub::Hub;
use crate::presence::PresenceRegistry;
use crate::rate_limit::RateLimiter;
use crate::router::EventRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palaver_server=debug")),
        )
        .init();

    info!("Starting Palaver server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store
    // -----------------------------------------------------------------------
    let database = Database::open_at(&config.database_path)?;
    // No connection survives a restart.
    let reset = database.reset_all_online()?;
    if reset > 0 {
        info!(users = reset, "Cleared stale online flags");
    }
    let db = Db::new(database);

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let blob_store = Arc::new(
        BlobStore::new(config.blob_storage_path.clone(), config.max_blob_size).await?,
    );
    let tokens = Arc::new(TokenAuthority::new(config.token_secret, config.token_ttl));
    let router = EventRouter::new(
        db.clone(),
        Arc::new(Hub::new()),
        Arc::new(PresenceRegistry::new()),
    );

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();

    let http_addr = config.http_addr;
    let app_state = AppState {
        db,
        router,
        tokens,
        blob_store,
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Every 5 minutes, evict rate limit buckets idle for more than 10 minutes
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let evicted = rate_limiter.purge_stale(600.0).await;
            if evicted > 0 {
                tracing::debug!(evicted, "Purged idle rate limit buckets");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 6. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
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
