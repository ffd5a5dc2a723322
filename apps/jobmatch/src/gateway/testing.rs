//! Scripted in-memory gateway for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::analysis::models::JobPayload;
use crate::conversation::models::Profile;
use crate::gateway::{AnalysisResult, ElicitReply, GatewayError, ReasoningGateway};

#[derive(Debug, Clone)]
pub struct ElicitCall {
    pub message: String,
    pub history_len: usize,
    pub locale: String,
}

/// Answers from queued replies, falling back to a canned answer when the
/// queue is empty. Every call sleeps for the configured latency first.
#[derive(Default)]
pub struct ScriptedGateway {
    elicit_replies: Mutex<VecDeque<Result<ElicitReply, GatewayError>>>,
    analyze_replies: Mutex<VecDeque<Result<AnalysisResult, GatewayError>>>,
    latency: Mutex<Duration>,
    elicit_calls: AtomicUsize,
    analyze_calls: AtomicUsize,
    elicit_log: Mutex<Vec<ElicitCall>>,
    analyzed_titles: Mutex<Vec<String>>,
}

pub fn reply(text: &str, progress: u32, complete: bool) -> ElicitReply {
    ElicitReply {
        assistant_text: text.to_string(),
        stage: Some("skills".to_string()),
        progress: Some(progress),
        is_complete: complete,
    }
}

pub fn analysis(score: u32) -> AnalysisResult {
    AnalysisResult {
        score,
        strengths: vec!["Rust".to_string()],
        weaknesses: vec!["Kafka".to_string()],
        recommendation: "Worth applying".to_string(),
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn push_elicit(&self, reply: Result<ElicitReply, GatewayError>) {
        self.elicit_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_analysis(&self, result: Result<AnalysisResult, GatewayError>) {
        self.analyze_replies.lock().unwrap().push_back(result);
    }

    pub fn elicit_calls(&self) -> usize {
        self.elicit_calls.load(Ordering::SeqCst)
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn elicit_log(&self) -> Vec<ElicitCall> {
        self.elicit_log.lock().unwrap().clone()
    }

    pub fn analyzed_titles(&self) -> Vec<String> {
        self.analyzed_titles.lock().unwrap().clone()
    }

    async fn wait(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ReasoningGateway for ScriptedGateway {
    async fn elicit(
        &self,
        profile: Option<&Profile>,
        message: &str,
        locale: &str,
    ) -> Result<ElicitReply, GatewayError> {
        self.elicit_calls.fetch_add(1, Ordering::SeqCst);
        self.elicit_log.lock().unwrap().push(ElicitCall {
            message: message.to_string(),
            history_len: profile.map(|p| p.history.len()).unwrap_or(0),
            locale: locale.to_string(),
        });
        self.wait().await;
        let next = self.elicit_replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(reply("Tell me more.", 0, false)))
    }

    async fn analyze(
        &self,
        job: &JobPayload,
        _profile: Option<&Profile>,
    ) -> Result<AnalysisResult, GatewayError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        self.analyzed_titles.lock().unwrap().push(job.title.clone());
        self.wait().await;
        let next = self.analyze_replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(analysis(75)))
    }
}
