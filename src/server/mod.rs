//! Query/stream gateway
//!
//! Thin HTTP surface over the ingest service: a query endpoint that
//! translates wire parameters into a SearchQuery, a recent-records
//! endpoint backing the tail view, a stats endpoint, a health probe,
//! and an SSE stream fed from a fan-out subscription.
//!
//! All endpoints return JSON and are designed for local consumption;
//! authentication and the browser UI live in front of this router and
//! are not this crate's concern.

pub mod api;
pub mod stream;

use crate::ingest::IngestService;
use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Shared state for the handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestService>,
}

/// Bind and serve the gateway until the shutdown signal fires.
pub async fn run(
    bind: SocketAddr,
    service: Arc<IngestService>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = AppState { service };
    let app = Router::new()
        .route("/api/logs", get(api::search_logs))
        .route("/api/logs/recent", get(api::get_recent))
        .route("/api/stats", get(api::get_stats))
        .route("/api/healthz", get(api::healthz))
        .route("/api/stream", get(stream::stream_logs))
        .with_state(state);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding http gateway on {bind}"))?;
    tracing::info!("http gateway on {bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("http gateway failed")?;

    tracing::info!("http gateway stopped");
    Ok(())
}
