// Logtrail - RFC5424 syslog collection and retrieval service
//
// Accepts syslog over long-lived TCP connections, parses each line,
// fans it out to live subscribers, and commits it in batches to an
// embedded SQLite store with full-text indexing. An HTTP gateway serves
// historical queries and a real-time SSE stream.
//
// Architecture:
// - Listener (tokio): newline-framed RFC5424 lines over persistent TCP
// - Parser: pure validation/decomposition into typed records
// - Ingest service: fan-out to subscribers, then enqueue for commit
// - Batcher: bounded queue + dedicated writer thread, batched transactions
// - Store (rusqlite): WAL, FTS5 index, schema-signature hard reset
// - Gateway (axum): /api/logs, /api/logs/recent, /api/stats, /api/stream

mod batcher;
mod cli;
mod config;
mod fanout;
mod ingest;
mod listener;
mod parser;
mod record;
mod server;
mod store;

use anyhow::Result;
use config::Config;
use ingest::IngestService;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long the write queue gets to drain on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, --reset, --path).
    // If a command was handled, exit early.
    let Some(overrides) = cli::handle_cli() else {
        return Ok(());
    };

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let mut config = Config::from_env();
    overrides.apply(&mut config);

    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("logtrail={}", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("logtrail {} starting", config::VERSION);
    tracing::info!(
        "ingest on {}, gateway on {}, store at {}",
        config.tcp_bind,
        config.http_bind,
        config.db_path.display()
    );
    if config.auth.enabled {
        tracing::info!("gateway auth enabled for user {:?}", config.auth.user);
    }

    let store = Arc::new(Store::open(&config.db_path, config.store_options())?);
    let service = Arc::new(IngestService::new(
        store,
        config.ingest_config(),
        config.batcher_config(),
    ));
    service.start()?;

    // Every long-lived task watches this signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_config = config.listener_config();
    let listener_service = service.clone();
    let listener_shutdown = shutdown_rx.clone();
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener::run(listener_config, listener_service, listener_shutdown).await {
            tracing::error!("syslog listener failed: {e:#}");
        }
    });

    let gateway_bind = config.http_bind;
    let gateway_service = service.clone();
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = server::run(gateway_bind, gateway_service, shutdown_rx).await {
            tracing::error!("http gateway failed: {e:#}");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    // Teardown order: stop accepting bytes, wait for the reader tasks,
    // drain the write queue, then close subscriptions. The store closes
    // when the service drops.
    let _ = shutdown_tx.send(true);
    let _ = listener_handle.await;
    service.stop(DRAIN_DEADLINE);
    let _ = gateway_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}
