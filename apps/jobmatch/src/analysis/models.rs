use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::InputError;
use crate::gateway::{AnalysisResult, GatewayError};

/// A job posting as received from the job-listing source. Forwarded to the
/// gateway as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub title: String,
    pub employer: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub posting_id: Option<String>,
}

impl JobPayload {
    pub fn validate(&self) -> Result<(), InputError> {
        if self.title.trim().is_empty() {
            return Err(InputError::MalformedJob("title is required".to_string()));
        }
        if self.employer.trim().is_empty() {
            return Err(InputError::MalformedJob("employer is required".to_string()));
        }
        Ok(())
    }
}

/// Opaque identity of a job in the analysis registry. Deserializing goes
/// through `JobKey::new`, so a blank key never enters the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey(String);

impl JobKey {
    /// Wraps a caller-supplied key. The content is never inspected beyond
    /// rejecting blank keys.
    pub fn new(key: impl Into<String>) -> Result<Self, InputError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(InputError::BlankKey);
        }
        Ok(Self(key))
    }

    /// Derives a key from the posting. Uses the posting id when present,
    /// otherwise the normalized `title|employer|location`.
    pub fn derive(job: &JobPayload) -> Self {
        if let Some(id) = job.posting_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Self(format!("posting:{id}"));
        }
        let mut parts = vec![normalize(&job.title), normalize(&job.employer)];
        if let Some(location) = job.location.as_deref().map(normalize).filter(|s| !s.is_empty()) {
            parts.push(location);
        }
        Self(parts.join("|"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobKey {
    type Error = InputError;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        Self::new(key)
    }
}

impl From<JobKey> for String {
    fn from(key: JobKey) -> Self {
        key.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisState {
    Absent,
    Pending,
    Ready,
    Failed,
}

/// Why the last analysis attempt for a key failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisFailure {
    pub message: String,
    pub retryable: bool,
}

impl From<&GatewayError> for AnalysisFailure {
    fn from(e: &GatewayError) -> Self {
        Self {
            message: e.to_string(),
            retryable: e.is_transient(),
        }
    }
}

/// Registry entry for one job key. Callers only ever hold copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisEntry {
    pub key: JobKey,
    pub state: AnalysisState,
    /// Present only when `state == Ready`.
    pub result: Option<AnalysisResult>,
    /// Present only when `state == Failed`.
    pub error: Option<AnalysisFailure>,
    pub requested_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisEntry {
    pub fn absent(key: JobKey) -> Self {
        Self {
            key,
            state: AnalysisState::Absent,
            result: None,
            error: None,
            requested_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn pending(key: JobKey, requested_at: DateTime<Utc>) -> Self {
        Self {
            state: AnalysisState::Pending,
            requested_at: Some(requested_at),
            ..Self::absent(key)
        }
    }

    pub(crate) fn ready(key: JobKey, requested_at: DateTime<Utc>, result: AnalysisResult) -> Self {
        Self {
            state: AnalysisState::Ready,
            result: Some(result),
            requested_at: Some(requested_at),
            completed_at: Some(Utc::now()),
            ..Self::absent(key)
        }
    }

    pub(crate) fn failed(key: JobKey, requested_at: DateTime<Utc>, error: &GatewayError) -> Self {
        Self {
            state: AnalysisState::Failed,
            error: Some(error.into()),
            requested_at: Some(requested_at),
            completed_at: Some(Utc::now()),
            ..Self::absent(key)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Re-run the analysis even if a cached result exists.
    pub force_refresh: bool,
    /// Overrides the deduplicator's default gateway timeout.
    pub timeout: Option<Duration>,
}

/// State-change notification for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisEvent {
    pub key: JobKey,
    /// `Absent` when the entry was cleared.
    pub state: AnalysisState,
}
