//! AnalysisDeduplicator — single-flight, cached compatibility analysis per job key.
//!
//! Per key:
//! 1. `Ready` and no `force_refresh` → cached entry, no gateway call.
//! 2. `Pending` → join the call already in flight; every waiter gets the same outcome.
//! 3. otherwise → mark `Pending`, spawn the gateway call, settle to `Ready` / `Failed`.
//!
//! The gateway call runs on its own task so the registry is settled even when
//! every waiter has gone away. Waiters hold a `Shared` handle to that task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::analysis::models::{
    AnalysisEntry, AnalysisEvent, AnalysisOptions, AnalysisState, JobKey, JobPayload,
};
use crate::conversation::models::Profile;
use crate::errors::AppError;
use crate::gateway::{with_timeout, AnalysisResult, GatewayError, ReasoningGateway};

const EVENT_CAPACITY: usize = 256;

type Outcome = Result<AnalysisEntry, GatewayError>;
type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;

enum Slot {
    Pending {
        generation: u64,
        requested_at: DateTime<Utc>,
        /// Entry to fall back to if a forced refresh is rejected outright.
        previous: Option<AnalysisEntry>,
        outcome: SharedOutcome,
        abort: AbortHandle,
    },
    Settled(AnalysisEntry),
}

impl Slot {
    fn entry(&self, key: &JobKey) -> AnalysisEntry {
        match self {
            Slot::Pending { requested_at, .. } => AnalysisEntry::pending(key.clone(), *requested_at),
            Slot::Settled(entry) => entry.clone(),
        }
    }
}

#[derive(Default)]
struct Registry {
    slots: HashMap<JobKey, Slot>,
    next_generation: u64,
}

enum Existing {
    Cached(AnalysisEntry),
    InFlight(SharedOutcome),
}

struct Inner {
    gateway: Arc<dyn ReasoningGateway>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<AnalysisEvent>,
    timeout: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, key: &JobKey, state: AnalysisState) {
        let _ = self.events.send(AnalysisEvent {
            key: key.clone(),
            state,
        });
    }

    /// Records the outcome of the call identified by `generation`. A call whose
    /// slot was cleared (or replaced) in the meantime is handed back to its
    /// waiters without touching the registry.
    fn settle(
        &self,
        key: &JobKey,
        generation: u64,
        requested_at: DateTime<Utc>,
        result: Result<AnalysisResult, GatewayError>,
    ) -> Outcome {
        let mut registry = self.lock();
        let previous = match registry.slots.remove(key) {
            Some(Slot::Pending {
                generation: g,
                previous,
                ..
            }) if g == generation => previous,
            other => {
                if let Some(slot) = other {
                    registry.slots.insert(key.clone(), slot);
                }
                debug!(key = %key, "Discarding result for cleared analysis");
                return result.map(|r| AnalysisEntry::ready(key.clone(), requested_at, r));
            }
        };

        match result {
            Ok(result) => {
                let entry = AnalysisEntry::ready(key.clone(), requested_at, result);
                info!(key = %key, score = ?entry.result.as_ref().map(|r| r.score), "Analysis ready");
                registry.slots.insert(key.clone(), Slot::Settled(entry.clone()));
                self.notify(key, AnalysisState::Ready);
                Ok(entry)
            }
            Err(e) => {
                let restored = previous.filter(|p| !e.is_transient() && p.state == AnalysisState::Ready);
                let entry = match restored {
                    Some(previous) => {
                        warn!(key = %key, "Refresh rejected, keeping previous result: {e}");
                        previous
                    }
                    None => {
                        warn!(key = %key, transient = e.is_transient(), "Analysis failed: {e}");
                        AnalysisEntry::failed(key.clone(), requested_at, &e)
                    }
                };
                let state = entry.state;
                registry.slots.insert(key.clone(), Slot::Settled(entry));
                self.notify(key, state);
                Err(e)
            }
        }
    }
}

/// Owns the analysis registry of one user session. Cloning yields another
/// handle to the same registry.
#[derive(Clone)]
pub struct AnalysisDeduplicator {
    inner: Arc<Inner>,
}

impl AnalysisDeduplicator {
    pub fn new(gateway: Arc<dyn ReasoningGateway>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                gateway,
                registry: Mutex::new(Registry::default()),
                events,
                timeout,
            }),
        }
    }

    /// Returns the analysis for `key`, issuing at most one gateway call per key
    /// at a time.
    pub async fn request_analysis(
        &self,
        key: JobKey,
        job: JobPayload,
        profile: Option<Profile>,
        options: AnalysisOptions,
    ) -> Result<AnalysisEntry, AppError> {
        job.validate()?;

        let outcome = {
            let mut registry = self.inner.lock();
            let existing = registry.slots.get(&key).and_then(|slot| match slot {
                Slot::Settled(entry)
                    if entry.state == AnalysisState::Ready && !options.force_refresh =>
                {
                    Some(Existing::Cached(entry.clone()))
                }
                Slot::Pending { outcome, .. } => Some(Existing::InFlight(outcome.clone())),
                Slot::Settled(_) => None,
            });

            match existing {
                Some(Existing::Cached(entry)) => {
                    debug!(key = %key, "Analysis cache hit");
                    return Ok(entry);
                }
                Some(Existing::InFlight(outcome)) => {
                    debug!(key = %key, "Joining analysis already in flight");
                    outcome
                }
                None => {
                    let timeout = options.timeout.unwrap_or(self.inner.timeout);
                    self.launch(&mut registry, key, job, profile, timeout)
                }
            }
        };

        outcome.await.map_err(AppError::from)
    }

    /// Spawns the gateway call and registers it as `Pending`. The registry lock
    /// is held by the caller, so the task cannot settle before the slot exists.
    fn launch(
        &self,
        registry: &mut Registry,
        key: JobKey,
        job: JobPayload,
        profile: Option<Profile>,
        timeout: Duration,
    ) -> SharedOutcome {
        registry.next_generation += 1;
        let generation = registry.next_generation;
        let requested_at = Utc::now();
        let previous = match registry.slots.remove(&key) {
            Some(Slot::Settled(entry)) => Some(entry),
            _ => None,
        };

        info!(key = %key, refresh = previous.is_some(), "Requesting compatibility analysis");

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = with_timeout(timeout, inner.gateway.analyze(&job, profile.as_ref()))
                .await
                .and_then(AnalysisResult::validate);
            inner.settle(&task_key, generation, requested_at, result)
        });
        let abort = handle.abort_handle();
        let outcome = handle
            .map(|joined| joined.unwrap_or(Err(GatewayError::Cancelled)))
            .boxed()
            .shared();

        registry.slots.insert(
            key.clone(),
            Slot::Pending {
                generation,
                requested_at,
                previous,
                outcome: outcome.clone(),
                abort,
            },
        );
        self.inner.notify(&key, AnalysisState::Pending);
        outcome
    }

    /// Current entry for `key`; `Absent` if never requested or cleared.
    pub fn peek(&self, key: &JobKey) -> AnalysisEntry {
        self.inner
            .lock()
            .slots
            .get(key)
            .map(|slot| slot.entry(key))
            .unwrap_or_else(|| AnalysisEntry::absent(key.clone()))
    }

    /// Copies of every entry in the registry.
    pub fn entries(&self) -> Vec<AnalysisEntry> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|(key, slot)| slot.entry(key))
            .collect()
    }

    /// Removes one entry, or all of them. Calls in flight for removed keys are
    /// aborted; their waiters receive `GatewayError::Cancelled`.
    pub fn clear(&self, key: Option<&JobKey>) {
        let removed: Vec<JobKey> = {
            let mut registry = self.inner.lock();
            let slots: Vec<(JobKey, Slot)> = match key {
                Some(key) => registry
                    .slots
                    .remove(key)
                    .map(|slot| (key.clone(), slot))
                    .into_iter()
                    .collect(),
                None => registry.slots.drain().collect(),
            };
            slots
                .into_iter()
                .map(|(key, slot)| {
                    if let Slot::Pending { abort, .. } = slot {
                        abort.abort();
                    }
                    key
                })
                .collect()
        };

        for key in &removed {
            self.inner.notify(key, AnalysisState::Absent);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleared analysis entries");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.inner.events.subscribe()
    }

    /// Notifications for a single key.
    pub fn subscribe_key(&self, key: JobKey) -> KeySubscription {
        KeySubscription {
            key,
            rx: self.subscribe(),
        }
    }
}

pub struct KeySubscription {
    key: JobKey,
    rx: broadcast::Receiver<AnalysisEvent>,
}

impl KeySubscription {
    /// Next event for this key; `None` once the deduplicator is gone.
    pub async fn recv(&mut self) -> Option<AnalysisEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key == self.key => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "Analysis subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
