//! SSE streaming endpoint
//!
//! Upgrades a request into a live tail: one fan-out subscription, one
//! JSON-encoded record per SSE frame, in acceptance order. The records
//! arrive before their durable commit, so a frame carries no id.

use super::AppState;
use crate::fanout::OverflowPolicy;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamParams {
    /// Strict consumers are disconnected when they fall behind instead
    /// of silently losing records.
    #[serde(default)]
    strict: bool,
}

/// GET /api/stream - live record tail over SSE.
pub(crate) async fn stream_logs(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let policy = if params.strict {
        OverflowPolicy::Disconnect
    } else {
        OverflowPolicy::DropNewest
    };
    let subscription = state.service.subscribe(policy);
    let (id, rx) = subscription.into_parts();
    tracing::debug!("stream subscriber {} connected (strict={})", id, params.strict);

    // When the client goes away the receiver drops, and the fan-out
    // evicts the subscription on its next dispatch pass; in strict mode
    // an overflow closes the channel and this stream simply ends.
    let stream = ReceiverStream::new(rx).filter_map(move |record| {
        match Event::default().event("record").json_data(record.as_ref()) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::error!("failed to encode record for stream: {e}");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
