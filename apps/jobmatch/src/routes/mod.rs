pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::analysis::handlers as analysis;
use crate::conversation::handlers as conversation;
use crate::session::handlers as session;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Sessions
        .route("/api/v1/sessions", post(session::handle_create_session))
        .route("/api/v1/sessions/:id", delete(session::handle_end_session))
        .route(
            "/api/v1/sessions/:id/snapshot",
            post(session::handle_snapshot),
        )
        .route(
            "/api/v1/sessions/:id/events",
            get(session::handle_session_events),
        )
        // Elicitation dialogue
        .route(
            "/api/v1/sessions/:id/conversation",
            get(conversation::handle_get_conversation),
        )
        .route(
            "/api/v1/sessions/:id/conversation/start",
            post(conversation::handle_start),
        )
        .route(
            "/api/v1/sessions/:id/conversation/turns",
            post(conversation::handle_submit_turn),
        )
        .route(
            "/api/v1/sessions/:id/conversation/reset",
            post(conversation::handle_reset),
        )
        // Compatibility analyses
        .route(
            "/api/v1/sessions/:id/analyses",
            post(analysis::handle_request_analysis).delete(analysis::handle_clear_all_analyses),
        )
        .route(
            "/api/v1/sessions/:id/analyses/:key",
            get(analysis::handle_peek_analysis).delete(analysis::handle_clear_analysis),
        )
        .with_state(state)
}
