//! Axum route handlers for the elicitation dialogue.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::models::Profile;
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub locale: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub profile: Option<Profile>,
    pub thinking: bool,
}

/// POST /api/v1/sessions/:id/conversation/start
pub async fn handle_start(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    request: Option<Json<StartRequest>>,
) -> Result<Json<Profile>, AppError> {
    let session = state.sessions.get(session_id)?;
    let locale = request
        .and_then(|Json(r)| r.locale)
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| state.config.default_locale.clone());

    let profile = session.conversation.start(&locale).await?;
    Ok(Json(profile))
}

/// POST /api/v1/sessions/:id/conversation/turns
pub async fn handle_submit_turn(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<Profile>, AppError> {
    let session = state.sessions.get(session_id)?;
    let profile = session.conversation.submit_turn(&request.text).await?;
    Ok(Json(profile))
}

/// GET /api/v1/sessions/:id/conversation
pub async fn handle_get_conversation(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ConversationResponse>, AppError> {
    let session = state.sessions.get(session_id)?;
    Ok(Json(ConversationResponse {
        profile: session.conversation.current_profile(),
        thinking: session.conversation.is_thinking(),
    }))
}

/// POST /api/v1/sessions/:id/conversation/reset
pub async fn handle_reset(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let session = state.sessions.get(session_id)?;
    session.conversation.reset();
    Ok(StatusCode::NO_CONTENT)
}
