//! Axum route handlers for compatibility analyses.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::analysis::models::{AnalysisEntry, AnalysisOptions, JobKey, JobPayload};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AnalysisRequestBody {
    /// Caller-supplied key; derived from the job when omitted.
    #[serde(default)]
    pub key: Option<String>,
    pub job: JobPayload,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// POST /api/v1/sessions/:id/analyses
///
/// Returns the cached analysis, joins one already in flight, or starts one.
/// The profile elicited so far (if any) is sent along with the job.
pub async fn handle_request_analysis(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<AnalysisRequestBody>,
) -> Result<Json<AnalysisEntry>, AppError> {
    let session = state.sessions.get(session_id)?;
    let key = match request.key {
        Some(key) => JobKey::new(key)?,
        None => JobKey::derive(&request.job),
    };
    let options = AnalysisOptions {
        force_refresh: request.force_refresh,
        timeout: request.timeout_ms.map(Duration::from_millis),
    };

    let entry = session
        .analyses
        .request_analysis(
            key,
            request.job,
            session.conversation.current_profile(),
            options,
        )
        .await?;
    Ok(Json(entry))
}

/// GET /api/v1/sessions/:id/analyses/:key
pub async fn handle_peek_analysis(
    State(state): State<AppState>,
    Path((session_id, key)): Path<(Uuid, String)>,
) -> Result<Json<AnalysisEntry>, AppError> {
    let session = state.sessions.get(session_id)?;
    let key = JobKey::new(key)?;
    Ok(Json(session.analyses.peek(&key)))
}

/// DELETE /api/v1/sessions/:id/analyses/:key
pub async fn handle_clear_analysis(
    State(state): State<AppState>,
    Path((session_id, key)): Path<(Uuid, String)>,
) -> Result<StatusCode, AppError> {
    let session = state.sessions.get(session_id)?;
    let key = JobKey::new(key)?;
    session.analyses.clear(Some(&key));
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/v1/sessions/:id/analyses
pub async fn handle_clear_all_analyses(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let session = state.sessions.get(session_id)?;
    session.analyses.clear(None);
    Ok(StatusCode::NO_CONTENT)
}
