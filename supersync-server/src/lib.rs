//! supersync-server: authoritative host for supersync documents.
//!
//! Holds the project manifest, entries and chat rooms in memory, persists them to a
//! backing store, and serves them to clients over a JSON WebSocket protocol.

pub mod auth;
pub mod cli;
pub mod config;
pub mod hub;
pub mod protocol;
pub mod ratelimit;
pub mod server;

use std::sync::Arc;

use anyhow::Result;
use supersync_core::{BackingStore, FsStore, MemoryStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{config::ServerConfig, hub::Hub, ratelimit::RateLimiter, server::AppState};

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn open_store(config: &ServerConfig) -> Result<Arc<dyn BackingStore>> {
    match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            info!(dir = %dir.display(), "storing documents on disk");
            Ok(Arc::new(FsStore::new(dir)))
        }
        None => {
            info!("storing documents in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Run the server using CLI args (parsed by the caller).
pub async fn run_with_cli(cli: cli::Cli) -> Result<()> {
    init_tracing(cli.verbose)?;

    let config = ServerConfig::from_cli(&cli)?;
    let store = open_store(&config)?;
    let hub = Hub::open(store).await?;

    let state = AppState {
        hub: Arc::new(hub),
        auth: Arc::new(config.auth.clone()),
        rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
    };
    server::serve(&config.listen_addr, state).await
}
