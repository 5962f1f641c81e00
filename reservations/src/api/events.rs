//! Event feed.
//!
//! `GET /events?after=<position>&limit=<n>` pages through the event store in
//! commit order. Consumers remember the last `position` they processed and
//! pass it as `after` to resume; delivery is at least once, so they dedupe by
//! `(aggregateId, sequenceNumber)`.

use crate::aggregate::ReservationEvent;
use crate::app::AppState;
use crate::numbering::ReservationNumberAllocated;
use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{DateTime, Utc};
use medtour_core::event::StoredEvent;
use medtour_core::stream::{AggregateId, GlobalPosition, Version};
use medtour_web::{AppError, WebResult};
use serde::{Deserialize, Serialize};

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1_000;

/// Feed parameters.
#[derive(Debug, Deserialize)]
pub struct FeedParams {
    /// Exclusive start position, 0 for the beginning
    pub after: Option<u64>,
    /// Page size
    pub limit: Option<usize>,
}

/// One event of the feed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent {
    /// Global commit position
    pub position: GlobalPosition,
    /// Aggregate the event belongs to
    pub aggregate_id: AggregateId,
    /// Position within the aggregate
    pub sequence_number: Version,
    /// Versioned type, e.g. `ReservationConfirmed.v1`
    pub event_type: String,
    /// When the event happened
    pub occurred_at: DateTime<Utc>,
    /// Decoded payload, `null` for unknown types
    pub data: Option<serde_json::Value>,
}

/// A page of the feed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    /// Events in commit order
    pub events: Vec<FeedEvent>,
    /// Pass as `after` to fetch the next page
    pub next_after: GlobalPosition,
}

/// Read a page of the event log.
///
/// # Errors
///
/// 503 if the event store cannot be read.
pub async fn feed(State(state): State<AppState>, Query(params): Query<FeedParams>) -> WebResult<Json<FeedPage>> {
    let after = GlobalPosition::new(params.after.unwrap_or(0));
    let limit = params.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

    let stored = state
        .event_store
        .read_all(after, limit)
        .await
        .map_err(|e| AppError::unavailable("the event store is unavailable").with_source(e.into()))?;

    let next_after = stored.last().map_or(after, |e| e.position);
    Ok(Json(FeedPage {
        events: stored.into_iter().map(feed_event).collect(),
        next_after,
    }))
}

fn feed_event(stored: StoredEvent) -> FeedEvent {
    let event = stored.event;
    let data = match event.event_type.as_str() {
        t if ReservationEvent::is_reservation_event(t) => event
            .decode::<ReservationEvent>()
            .ok()
            .and_then(|e| serde_json::to_value(e).ok()),
        ReservationNumberAllocated::EVENT_TYPE => event
            .decode::<ReservationNumberAllocated>()
            .ok()
            .and_then(|e| serde_json::to_value(e).ok()),
        _ => None,
    };

    FeedEvent {
        position: stored.position,
        aggregate_id: event.aggregate_id,
        sequence_number: event.sequence_number,
        event_type: event.event_type,
        occurred_at: event.occurred_at,
        data,
    }
}
