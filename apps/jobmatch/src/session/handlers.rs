use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::analysis::models::JobKey;
use crate::errors::AppError;
use crate::presentation::{JobListing, SessionEvent, SessionView};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SessionCreatedResponse {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default)]
    pub listings: Vec<JobListing>,
}

/// POST /api/v1/sessions
pub async fn handle_create_session(
    State(state): State<AppState>,
) -> (StatusCode, Json<SessionCreatedResponse>) {
    let session = state.sessions.create();
    (
        StatusCode::CREATED,
        Json(SessionCreatedResponse {
            session_id: session.id,
            created_at: session.created_at,
        }),
    )
}

/// DELETE /api/v1/sessions/:id
pub async fn handle_end_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.sessions.end(session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/:id/snapshot
///
/// Merged view of the dialogue and the analyses for the supplied listings.
pub async fn handle_snapshot(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SnapshotRequest>,
) -> Result<Json<SessionView>, AppError> {
    let session = state.sessions.get(session_id)?;
    Ok(Json(session.presentation.snapshot(&request.listings)))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only analysis events for this job key; dialogue events always pass.
    #[serde(default)]
    pub key: Option<String>,
}

/// GET /api/v1/sessions/:id/events
///
/// Server-sent events: `conversation` carries a `ConversationEvent`,
/// `analysis` an `AnalysisEvent`. The stream ends with the session.
pub async fn handle_session_events(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.sessions.get(session_id)?;
    let key = query.key.map(JobKey::new).transpose()?;
    debug!(session_id = %session_id, key = ?key, "Event stream opened");

    let updates = session.presentation.updates(key);
    let events = stream::unfold(updates, |mut updates| async move {
        updates.next().await.map(|event| (event, updates))
    })
    .map(|event: SessionEvent| {
        let data = event.to_json().unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event(event.source()).data(data))
    });

    Ok((
        [("X-Accel-Buffering", "no"), ("Cache-Control", "no-cache")],
        Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("")),
    ))
}
