//! Result presentation — merges dialogue state, analysis entries and job
//! listings into one immutable view per render.
//!
//! `build_view` is a pure function; `ResultPresentationAdapter` only reads
//! copies from its upstream components and never touches the network.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::analysis::models::{
    AnalysisEntry, AnalysisEvent, AnalysisFailure, AnalysisState, JobKey, JobPayload,
};
use crate::analysis::dedup::KeySubscription;
use crate::analysis::AnalysisDeduplicator;
use crate::conversation::models::{ConversationEvent, Profile, Stage, Turn};
use crate::conversation::ConversationOrchestrator;

/// A job as listed by the external job-search source. `key` overrides the
/// derived key when the listing source already has a stable identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListing {
    #[serde(default)]
    pub key: Option<JobKey>,
    #[serde(flatten)]
    pub job: JobPayload,
}

impl JobListing {
    pub fn key(&self) -> JobKey {
        self.key.clone().unwrap_or_else(|| JobKey::derive(&self.job))
    }
}

/// Display band for a compatibility score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitBand {
    Strong,   // ≥ 80
    Moderate, // 60 – 79
    Low,      // < 60
}

impl FitBand {
    pub fn from_score(score: u32) -> Self {
        if score >= 80 {
            FitBand::Strong
        } else if score >= 60 {
            FitBand::Moderate
        } else {
            FitBand::Low
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub stage: Stage,
    pub sub_stage: Option<String>,
    pub progress: u8,
    pub turns: Vec<Turn>,
    pub thinking: bool,
    pub can_submit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobCard {
    pub key: JobKey,
    pub title: String,
    pub employer: String,
    pub location: Option<String>,
    pub url: Option<String>,
    pub analysis_state: AnalysisState,
    pub score: Option<u32>,
    pub fit_band: Option<FitBand>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub recommendation: Option<String>,
    pub error: Option<AnalysisFailure>,
    /// False while an analysis is pending or already available.
    pub can_request: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub conversation: ConversationView,
    pub jobs: Vec<JobCard>,
    pub pending: usize,
    pub ready: usize,
    pub failed: usize,
    pub generated_at: DateTime<Utc>,
}

pub fn build_view(
    profile: Option<&Profile>,
    thinking: bool,
    entries: &HashMap<JobKey, AnalysisEntry>,
    listings: &[JobListing],
) -> SessionView {
    let conversation = match profile {
        Some(p) => ConversationView {
            stage: p.stage,
            sub_stage: p.sub_stage.clone(),
            progress: p.progress,
            turns: p.history.clone(),
            thinking,
            can_submit: p.stage == Stage::InProgress && !thinking,
        },
        None => ConversationView {
            stage: Stage::NotStarted,
            sub_stage: None,
            progress: 0,
            turns: Vec::new(),
            thinking,
            can_submit: false,
        },
    };

    let jobs: Vec<JobCard> = listings
        .iter()
        .map(|listing| {
            let key = listing.key();
            let entry = entries.get(&key);
            let state = entry.map(|e| e.state).unwrap_or(AnalysisState::Absent);
            let result = entry.and_then(|e| e.result.as_ref());
            JobCard {
                title: listing.job.title.clone(),
                employer: listing.job.employer.clone(),
                location: listing.job.location.clone(),
                url: listing.job.url.clone(),
                analysis_state: state,
                score: result.map(|r| r.score),
                fit_band: result.map(|r| FitBand::from_score(r.score)),
                strengths: result.map(|r| r.strengths.clone()).unwrap_or_default(),
                weaknesses: result.map(|r| r.weaknesses.clone()).unwrap_or_default(),
                recommendation: result.map(|r| r.recommendation.clone()),
                error: entry.and_then(|e| e.error.clone()),
                can_request: matches!(state, AnalysisState::Absent | AnalysisState::Failed),
                key,
            }
        })
        .collect();

    let count = |state: AnalysisState| jobs.iter().filter(|j| j.analysis_state == state).count();

    SessionView {
        pending: count(AnalysisState::Pending),
        ready: count(AnalysisState::Ready),
        failed: count(AnalysisState::Failed),
        conversation,
        jobs,
        generated_at: Utc::now(),
    }
}

/// Read-only view over one session's orchestrator and deduplicator.
#[derive(Clone)]
pub struct ResultPresentationAdapter {
    conversation: Arc<ConversationOrchestrator>,
    analyses: AnalysisDeduplicator,
}

impl ResultPresentationAdapter {
    pub fn new(conversation: Arc<ConversationOrchestrator>, analyses: AnalysisDeduplicator) -> Self {
        Self {
            conversation,
            analyses,
        }
    }

    pub fn snapshot(&self, listings: &[JobListing]) -> SessionView {
        let profile = self.conversation.current_profile();
        let entries: HashMap<JobKey, AnalysisEntry> = self
            .analyses
            .entries()
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        build_view(
            profile.as_ref(),
            self.conversation.is_thinking(),
            &entries,
            listings,
        )
    }

    /// Notifications from either upstream component; recompute the snapshot
    /// after each one. With `key`, analysis events for other jobs are
    /// filtered out; dialogue events always pass.
    pub fn updates(&self, key: Option<JobKey>) -> ViewUpdates {
        let analyses = match key {
            Some(key) => AnalysisFeed::Key(self.analyses.subscribe_key(key)),
            None => AnalysisFeed::All(self.analyses.subscribe()),
        };
        ViewUpdates {
            conversation: Some(self.conversation.subscribe()),
            analyses: Some(analyses),
        }
    }
}

/// One upstream notification, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Conversation(ConversationEvent),
    Analysis(AnalysisEvent),
}

impl SessionEvent {
    pub fn source(&self) -> &'static str {
        match self {
            SessionEvent::Conversation(_) => "conversation",
            SessionEvent::Analysis(_) => "analysis",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            SessionEvent::Conversation(event) => serde_json::to_string(event),
            SessionEvent::Analysis(event) => serde_json::to_string(event),
        }
    }
}

enum AnalysisFeed {
    All(broadcast::Receiver<AnalysisEvent>),
    Key(KeySubscription),
}

impl AnalysisFeed {
    async fn recv(&mut self) -> Option<AnalysisEvent> {
        match self {
            AnalysisFeed::Key(sub) => sub.recv().await,
            AnalysisFeed::All(rx) => recv_skipping_lag(rx, "analysis").await,
        }
    }
}

pub struct ViewUpdates {
    conversation: Option<broadcast::Receiver<ConversationEvent>>,
    analyses: Option<AnalysisFeed>,
}

impl ViewUpdates {
    /// Waits for the next upstream event. Returns `None` once both upstream
    /// components are gone.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            tokio::select! {
                event = next_conversation(&mut self.conversation), if self.conversation.is_some() => {
                    match event {
                        Some(event) => return Some(SessionEvent::Conversation(event)),
                        None => self.conversation = None,
                    }
                }
                event = next_analysis(&mut self.analyses), if self.analyses.is_some() => {
                    match event {
                        Some(event) => return Some(SessionEvent::Analysis(event)),
                        None => self.analyses = None,
                    }
                }
                else => return None,
            }
        }
    }
}

async fn next_conversation(
    rx: &mut Option<broadcast::Receiver<ConversationEvent>>,
) -> Option<ConversationEvent> {
    recv_skipping_lag(rx.as_mut()?, "conversation").await
}

async fn next_analysis(feed: &mut Option<AnalysisFeed>) -> Option<AnalysisEvent> {
    feed.as_mut()?.recv().await
}

/// `None` once the channel is closed. A lagged receiver skips ahead.
async fn recv_skipping_lag<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    source: &'static str,
) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(source, skipped, "View subscriber lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}
