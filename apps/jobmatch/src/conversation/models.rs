use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// One message of the dialogue. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The elicited job-seeker profile: dialogue state plus its transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub stage: Stage,
    /// Gateway-supplied label such as "skills" or "preferences".
    pub sub_stage: Option<String>,
    pub progress: u8, // 0 – 100, never decreases
    pub history: Vec<Turn>,
    pub locale: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Profile {
    pub(crate) fn new(locale: &str) -> Self {
        Self {
            stage: Stage::NotStarted,
            sub_stage: None,
            progress: 0,
            history: Vec::new(),
            locale: locale.to_string(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    /// Raises progress to `reported`, clamped to 100. Lower values are ignored.
    pub(crate) fn advance_progress(&mut self, reported: Option<u32>) {
        if let Some(reported) = reported {
            let clamped = reported.min(100) as u8;
            self.progress = self.progress.max(clamped);
        }
    }

    pub fn user_turns(&self) -> usize {
        self.history
            .iter()
            .filter(|t| t.speaker == Speaker::User)
            .count()
    }
}

/// Notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    Started { progress: u8 },
    Updated { progress: u8, sub_stage: Option<String> },
    /// Published exactly once per dialogue.
    Completed,
    Reset,
}
