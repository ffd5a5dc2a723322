use std::sync::Arc;

use crate::config::Config;
use crate::session::SessionRegistry;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Live user sessions. Each one owns its own dialogue and analysis registry.
    pub sessions: Arc<SessionRegistry>,
}
