//! Per-user sessions. Each session owns its own orchestrator, deduplicator
//! and presentation adapter; nothing is shared between sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::analysis::AnalysisDeduplicator;
use crate::conversation::ConversationOrchestrator;
use crate::errors::AppError;
use crate::gateway::ReasoningGateway;
use crate::presentation::ResultPresentationAdapter;

pub mod handlers;

pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub conversation: Arc<ConversationOrchestrator>,
    pub analyses: AnalysisDeduplicator,
    pub presentation: ResultPresentationAdapter,
    last_active: Mutex<Instant>,
}

impl Session {
    pub fn new(gateway: Arc<dyn ReasoningGateway>, timeout: Duration) -> Self {
        let conversation = Arc::new(ConversationOrchestrator::new(gateway.clone(), timeout));
        let analyses = AnalysisDeduplicator::new(gateway, timeout);
        let presentation = ResultPresentationAdapter::new(conversation.clone(), analyses.clone());
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            conversation,
            analyses,
            presentation,
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(
            *self.last_active.lock().unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Discards the dialogue and every analysis, aborting calls in flight.
    pub fn close(&self) {
        self.analyses.clear(None);
        self.conversation.reset();
    }
}

/// All live sessions, keyed by session id.
pub struct SessionRegistry {
    gateway: Arc<dyn ReasoningGateway>,
    timeout: Duration,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(gateway: Arc<dyn ReasoningGateway>, timeout: Duration) -> Self {
        Self {
            gateway,
            timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(self.gateway.clone(), self.timeout));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id, session.clone());
        info!(session_id = %session.id, "Session created");
        session
    }

    /// Looks up a session and marks it active.
    pub fn get(&self, id: Uuid) -> Result<Arc<Session>, AppError> {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Session {id} not found")))?;
        session.touch();
        Ok(session)
    }

    /// Ends a session (logout): its state is discarded, never persisted.
    pub fn end(&self, id: Uuid) -> Result<(), AppError> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("Session {id} not found")))?;
        session.close();
        info!(session_id = %id, "Session ended");
        Ok(())
    }

    /// Ends every session that has not been looked up for `max_idle`.
    /// Returns how many were discarded.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<Uuid> = sessions
                .values()
                .filter(|s| s.idle_for(now) >= max_idle)
                .map(|s| s.id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &expired {
            session.close();
            info!(session_id = %session.id, "Idle session expired");
        }
        expired.len()
    }

    /// Periodically prunes idle sessions for as long as the registry lives.
    pub fn spawn_pruner(self: &Arc<Self>, max_idle: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = (max_idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                registry.prune_idle(max_idle);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
