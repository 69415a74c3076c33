use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_core::Stream;
use notify_core::metrics;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::state::AppState;

use super::{parse_key, ApiError};

pub async fn prometheus_metrics() -> String {
    metrics::export_prometheus()
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub last_event_id: Option<u64>,
}

/// Long-lived event stream for one subscription key. Each frame carries
/// the envelope's sequence number as its SSE id so the client can
/// resume from it on reconnect, via the `Last-Event-ID` header or the
/// `last_event_id` query parameter. A client that sends neither starts
/// live-only; `0` asks for everything still retained.
pub async fn subscribe_events(
    State(state): State<AppState>,
    Path((domain, entity)): Path<(String, String)>,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let key = parse_key(&domain, &entity)?;
    let last_seen = header_last_event_id(&headers).or(query.last_event_id);

    let subscription = state
        .service
        .subscribe(key, last_seen)
        .await
        .map_err(|err| ApiError::Conflict(err.to_string()))?;
    debug!(
        connection = %subscription.id(),
        key = %subscription.key(),
        replayed = subscription.replay_len(),
        "event stream opened"
    );

    let stream = subscription.into_stream().map(|envelope| {
        let data = serde_json::to_string(&envelope.payload).unwrap_or_else(|_| "{}".into());
        Ok(Event::default()
            .id(envelope.seq.to_string())
            .event(envelope.event_type.as_str())
            .data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

fn header_last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
