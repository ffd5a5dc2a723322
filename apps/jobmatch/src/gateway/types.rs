//! Wire types exchanged with the remote reasoning gateway.

use serde::{Deserialize, Serialize};

use crate::analysis::models::JobPayload;
use crate::conversation::models::Profile;
use crate::gateway::GatewayError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ElicitRequest<'a> {
    pub profile: Option<&'a Profile>,
    pub message: &'a str,
    pub locale: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AnalyzeRequest<'a> {
    pub job: &'a JobPayload,
    pub profile: Option<&'a Profile>,
}

/// One assistant turn produced by `elicit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitReply {
    pub assistant_text: String,
    /// Opaque sub-stage label, e.g. "skills" or "preferences". Display only.
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub progress: Option<u32>,
    #[serde(default)]
    pub is_complete: bool,
}

impl ElicitReply {
    pub fn validate(self) -> Result<Self, GatewayError> {
        if self.assistant_text.trim().is_empty() {
            return Err(GatewayError::InvalidResponse(
                "elicit reply has no assistant text".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Compatibility analysis of one job against the elicited profile.
/// Owned by the gateway; passed through untouched apart from the range check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub score: u32, // 0 – 100
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub recommendation: String,
}

impl AnalysisResult {
    pub fn validate(self) -> Result<Self, GatewayError> {
        if self.score > 100 {
            return Err(GatewayError::InvalidResponse(format!(
                "score {} is outside 0-100",
                self.score
            )));
        }
        Ok(self)
    }
}
