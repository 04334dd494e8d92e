//! `/events` — Docker-style server-sent NDJSON feed of daemon lifecycle
//! events, replay-then-live exactly as `EventBus::subscribe` provides.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::error::DaemonError;
use crate::events::EventFilters;
use crate::network::NetworkAgentClient;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub filters: Option<String>,
}

/// Docker encodes `filters` as a JSON object of key -> array-of-values;
/// this reads the same shape into `EventFilters`' flat field layout.
fn parse_filters(raw: &str) -> EventFilters {
    let Ok(parsed) = serde_json::from_str::<HashMap<String, Vec<String>>>(raw) else {
        return EventFilters::default();
    };
    let take = |key: &str| parsed.get(key).cloned().unwrap_or_default();
    EventFilters {
        types: take("type"),
        events: take("event"),
        containers: take("container"),
        images: take("image"),
        networks: take("network"),
        volumes: take("volume"),
        labels: take("label"),
    }
}

pub async fn stream<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, DaemonError> {
    let filters = query.filters.as_deref().map(parse_filters).unwrap_or_default();
    let events = state.events.subscribe(query.since, query.until, filters);

    let body_stream = events.map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_default();
        line.push('\n');
        Ok::<_, std::io::Error>(bytes::Bytes::from(line))
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from_stream(body_stream))
        .unwrap())
}
