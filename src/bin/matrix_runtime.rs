//! Matrix Runtime
//!
//! Ticks one session on an interval:
//! - Runs schema migrations (idempotent)
//! - Opens the matrix store (WAL)
//! - Fetches the live snapshot, persists the tick, derives metrics
//!
//! Usage:
//!   cargo run --release --bin matrix_runtime
//!
//! Environment variables:
//!   MATRIX_DB_PATH - SQLite database path (default: matrixflow.db)
//!   MATRIX_SNAPSHOT_URL - Live snapshot endpoint
//!   MATRIX_TICK_INTERVAL_MS - Tick interval (default: 40000)
//!   ENABLE_MATRIX_RUNTIME - Master switch (default: false)

use dotenv::dotenv;
use log::{error, info};
use matrixflow::config::MatrixConfig;
use matrixflow::db::{open_connection, run_schema_migrations};
use matrixflow::{
    HttpSnapshotProvider, LocalStampCache, MatrixPipeline, MatrixStore, StaticUniverseResolver,
};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    info!("🚀 Matrix Runtime");

    let config = MatrixConfig::from_env();

    if !config.enabled {
        info!("⚠️  Runtime is DISABLED (set ENABLE_MATRIX_RUNTIME=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }

    let universe = config.universe();
    let session = config.session_key();

    info!("✅ Runtime ENABLED");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Session: {}", session);
    info!("   ├─ Universe: {}", universe.coins().join(","));
    info!("   ├─ Snapshot: {} (timeout {}ms)", config.snapshot_url, config.snapshot_timeout_ms);
    info!("   └─ Tick interval: {}ms", config.tick_interval_ms);

    info!("🔧 Initializing database...");
    let mut conn = open_connection(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn);

    let store = Arc::new(MatrixStore::open(&config.db_path, Arc::new(LocalStampCache::new()))?);
    info!("✅ Database initialized");

    let snapshots = Arc::new(HttpSnapshotProvider::new(
        config.snapshot_url.clone(),
        config.snapshot_timeout(),
    )?);
    let pipeline = Arc::new(MatrixPipeline::new(
        store,
        Arc::new(StaticUniverseResolver::new(universe)),
        snapshots,
        config.snapshot_timeout(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tick_loop =
        tokio::spawn(pipeline.run_tick_loop(session, config.tick_interval_ms, shutdown_rx));

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = tick_loop.await {
        error!("❌ Tick loop task failed: {}", e);
    }

    info!("✅ Matrix runtime stopped");
    Ok(())
}
