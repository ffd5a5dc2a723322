use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::gateway::GatewayError;

/// Rejected locally before any network call. Never mutates state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("message text cannot be empty")]
    EmptyInput,

    #[error("malformed job payload: {0}")]
    MalformedJob(String),

    #[error("job key cannot be blank")]
    BlankKey,
}

/// Caller-contract violations. Surfaced synchronously, never mutates state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("no dialogue has been started for this session")]
    NotStarted,

    #[error("the dialogue is complete and can no longer be modified")]
    AlreadyComplete,

    #[error("a turn is already being processed")]
    TurnInFlight,

    #[error("a dialogue is already active for this session")]
    AlreadyActive,

    #[error("the dialogue was reset while the call was in flight")]
    Superseded,
}

/// Coarse classification the presentation layer branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Input must change.
    Input,
    /// The call itself was illegal in the current state.
    State,
    /// Retry is safe.
    Transient,
    /// Gateway rejected the request; input must change.
    Terminal,
    NotFound,
    Internal,
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    Input(#[from] InputError),

    #[error("Illegal state: {0}")]
    State(#[from] StateError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Input(_) => ErrorClass::Input,
            AppError::State(_) => ErrorClass::State,
            AppError::Gateway(e) if e.is_transient() => ErrorClass::Transient,
            AppError::Gateway(_) => ErrorClass::Terminal,
            AppError::NotFound(_) => ErrorClass::NotFound,
            AppError::Internal(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retry_safe(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let retryable = self.is_retry_safe();
        let (status, code, message) = match &self {
            AppError::Input(e) => {
                let code = match e {
                    InputError::EmptyInput => "EMPTY_INPUT",
                    InputError::MalformedJob(_) => "MALFORMED_JOB",
                    InputError::BlankKey => "BLANK_KEY",
                };
                (StatusCode::BAD_REQUEST, code, e.to_string())
            }
            AppError::State(e) => {
                let code = match e {
                    StateError::NotStarted => "NOT_STARTED",
                    StateError::AlreadyComplete => "ALREADY_COMPLETE",
                    StateError::TurnInFlight => "TURN_IN_FLIGHT",
                    StateError::AlreadyActive => "ALREADY_ACTIVE",
                    StateError::Superseded => "SUPERSEDED",
                };
                (StatusCode::CONFLICT, code, e.to_string())
            }
            AppError::Gateway(e) => match e {
                GatewayError::Timeout(_) => {
                    tracing::warn!("Gateway timeout: {e}");
                    (
                        StatusCode::GATEWAY_TIMEOUT,
                        "GATEWAY_TIMEOUT",
                        "The reasoning service did not respond in time".to_string(),
                    )
                }
                _ if e.is_transient() => {
                    tracing::warn!("Transient gateway error: {e}");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "GATEWAY_UNAVAILABLE",
                        "The reasoning service is temporarily unavailable".to_string(),
                    )
                }
                _ => {
                    tracing::error!("Gateway rejected request: {e}");
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "GATEWAY_REJECTED",
                        e.to_string(),
                    )
                }
            },
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
                "class": self.class(),
                "retryable": retryable
            }
        }));

        (status, body).into_response()
    }
}
