use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_relay::{ConnectionRegistry, Relay};
use tracing::info;

mod accounts;
mod cache;
mod config;
mod db;
mod server;
mod telemetry;

use accounts::AccountService;
use cache::MemorySessionCache;
use config::ServerConfig;
use db::{Database, LibSqlStore, MigrationRunner};
use server::AppState;

/// Parley Server - real-time direct-messaging relay
#[derive(Parser)]
#[command(name = "parley-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on (overrides PARLEY_BIND_ADDR)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// libSQL database file (overrides PARLEY_DB_PATH; in-memory when unset)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Emit JSON logs (same as PARLEY_LOG_JSON=1)
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env().context("Invalid configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = Some(db_path);
    }
    config.log_json |= cli.log_json;

    telemetry::init(config.log_json)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    info!("Parley Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let db = Database::open("parley", config.db_path.as_deref())
        .await
        .context("Failed to open database")?;
    MigrationRunner::schema()
        .run(&db)
        .await
        .context("Failed to run migrations")?;

    let store = Arc::new(LibSqlStore::new(Arc::new(db)));
    let cache = Arc::new(MemorySessionCache::new(
        config.cache_capacity,
        config.recent_capacity,
    ));

    let accounts = AccountService::new(store.clone(), cache.clone(), config.session_ttl);
    let relay = Relay::new(
        Arc::new(ConnectionRegistry::new()),
        store,
        cache,
        config.relay_config(),
    );

    let state = Arc::new(AppState::new(accounts, relay));
    server::start(state, config.bind_addr).await?;

    info!("Parley Server stopped");
    Ok(())
}
