//! Reasoning Gateway client — the single point of entry for every call to the
//! remote reasoning service.
//!
//! ARCHITECTURAL RULE: no other module talks to the gateway over HTTP. The
//! orchestrator and the deduplicator only see the `ReasoningGateway` trait.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::analysis::models::JobPayload;
use crate::config::Config;
use crate::conversation::models::Profile;

pub mod types;

#[cfg(test)]
pub mod testing;

pub use types::{AnalysisResult, ElicitReply};
use types::{AnalyzeRequest, ElicitRequest};

/// Gateway failures. `Clone` so a single in-flight outcome can be handed to
/// every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unavailable(String),

    #[error("gateway did not respond within {0:?}")]
    Timeout(Duration),

    #[error("gateway server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("gateway rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("gateway returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("request was cancelled before it completed")]
    Cancelled,
}

impl GatewayError {
    /// Transient errors are safe to retry with the same input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Unavailable(_)
                | GatewayError::Timeout(_)
                | GatewayError::Server { .. }
                | GatewayError::Cancelled
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::InvalidResponse(e.to_string())
        } else {
            GatewayError::Unavailable(e.to_string())
        }
    }
}

/// The remote reasoning service as seen by the orchestrator.
#[async_trait]
pub trait ReasoningGateway: Send + Sync {
    /// Produces the next assistant turn. An empty `message` with no profile
    /// asks for the opening turn of a new dialogue.
    async fn elicit(
        &self,
        profile: Option<&Profile>,
        message: &str,
        locale: &str,
    ) -> Result<ElicitReply, GatewayError>;

    /// Scores one job posting against the elicited profile.
    async fn analyze(
        &self,
        job: &JobPayload,
        profile: Option<&Profile>,
    ) -> Result<AnalysisResult, GatewayError>;
}

/// Runs `fut` under `timeout`, folding an elapsed deadline into `GatewayError::Timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, GatewayError>
where
    F: std::future::Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout)),
    }
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    message: String,
}

/// Upper bound on establishing a connection. The overall call deadline is
/// set per call by `with_timeout` in the caller.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-over-HTTP gateway client with retry on 429 and 5xx.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    /// Retries after the first attempt.
    max_retries: u32,
    connect_timeout: Duration,
    backoff_base: Duration,
}

impl HttpGateway {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let connect_timeout = config.gateway_timeout.min(CONNECT_TIMEOUT);
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key: config.gateway_api_key.clone(),
            max_retries: config.gateway_max_retries,
            connect_timeout,
            backoff_base: Duration::from_millis(500),
        })
    }

    /// POSTs `body` to `{base_url}/{path}` and decodes the JSON reply.
    /// Retries on connect failures, 429 (rate limit) and 5xx errors with
    /// exponential backoff, up to `max_retries` times.
    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, GatewayError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 500ms, 1s, 2s, ...
                let delay = self.backoff_base * (1 << (attempt - 1).min(16));
                warn!(
                    "Gateway {} attempt {} failed, retrying after {}ms...",
                    path,
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&url).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) if e.is_connect() => {
                    last_error = Some(if e.is_timeout() {
                        GatewayError::Timeout(self.connect_timeout)
                    } else {
                        GatewayError::Unavailable(e.to_string())
                    });
                    continue;
                }
                Err(e) if e.is_timeout() => {
                    return Err(GatewayError::Timeout(self.connect_timeout))
                }
                // Anything past the connect phase may have reached the gateway.
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Gateway {} returned {}: {}", path, status, body);
                last_error = Some(GatewayError::Server {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<GatewayErrorBody>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                return Err(GatewayError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }

            let text = response.text().await?;
            debug!("Gateway {} succeeded ({} bytes)", path, text.len());
            return serde_json::from_str(&text)
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()));
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::Unavailable(format!("no attempt made against {url}"))
        }))
    }
}

#[async_trait]
impl ReasoningGateway for HttpGateway {
    async fn elicit(
        &self,
        profile: Option<&Profile>,
        message: &str,
        locale: &str,
    ) -> Result<ElicitReply, GatewayError> {
        let request = ElicitRequest {
            profile,
            message,
            locale,
        };
        self.post_json("elicit", &request).await
    }

    async fn analyze(
        &self,
        job: &JobPayload,
        profile: Option<&Profile>,
    ) -> Result<AnalysisResult, GatewayError> {
        let request = AnalyzeRequest { job, profile };
        self.post_json("analyze", &request).await
    }
}
