use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;

use super::runs::{parse_id, ApiError};
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct EventParams {
    pub from: Option<u64>,
}

/// Replay a run's events from `from` (or just past `Last-Event-ID`) and
/// follow it live until the run ends
pub async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<EventParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_id(&id)?;
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let from = start_seq(last_event_id, params.from);

    let subscription = state.registry.subscribe(id, from)?;
    let stream = subscription
        .into_stream()
        .take_until(shutdown_requested(state.shutdown.clone()))
        .map(|event| {
            let sse = Event::default()
                .id(event.seq.to_string())
                .event(event.kind.to_string())
                .data(serde_json::to_string(&event).unwrap_or_default());
            Ok(sse)
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Registry-wide session updates
pub async fn live_updates(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.registry.updates();
    let stream = BroadcastStream::new(rx)
        .take_until(shutdown_requested(state.shutdown.clone()))
        .map(|result| {
            let event = match result {
                Ok(update) => Event::default()
                    .event(update.event_name())
                    .data(serde_json::to_string(&update).unwrap_or_default()),
                Err(_) => Event::default().comment("missed event"),
            };
            Ok(event)
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// First sequence number to send: just past `Last-Event-ID` on reconnect,
/// else `?from`, else the beginning
fn start_seq(last_event_id: Option<u64>, from: Option<u64>) -> u64 {
    match (last_event_id, from) {
        (Some(last), _) => last.saturating_add(1),
        (None, Some(from)) => from,
        (None, None) => 1,
    }
}

/// Resolves once the server starts shutting down
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender also means the server is gone
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_seq() {
        assert_eq!(start_seq(None, None), 1);
        assert_eq!(start_seq(None, Some(4)), 4);
        assert_eq!(start_seq(Some(7), Some(2)), 8);
        assert_eq!(start_seq(Some(u64::MAX), None), u64::MAX);
    }
}
