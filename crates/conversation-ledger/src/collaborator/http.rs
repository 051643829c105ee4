use super::{CandidateGroup, MessageSpan, ReasoningCollaborator};
use crate::error::{LedgerError, LedgerResult};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// JSON-over-HTTP binding of the reasoning collaborator.
pub struct HttpReasoningClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpReasoningClient {
    pub fn new(base_url: &str, timeout: Duration) -> LedgerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::CollaboratorUnavailable(format!("failed to build HTTP client: {}", e)))?;

        info!("Reasoning collaborator at {} (timeout {:?})", base_url, timeout);
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> LedgerResult<serde_json::Value> {
        let url = self.url(path);
        debug!("POST {}", url);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| LedgerError::CollaboratorUnavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::CollaboratorUnavailable(format!("{} returned {}", url, status)));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| LedgerError::CollaboratorUnavailable(format!("{} sent an unreadable body: {}", url, e)))
    }
}

#[async_trait]
impl ReasoningCollaborator for HttpReasoningClient {
    async fn classify(&self, span: &MessageSpan) -> LedgerResult<serde_json::Value> {
        self.post("classify", span).await
    }

    async fn adjudicate(&self, group: &CandidateGroup) -> LedgerResult<serde_json::Value> {
        self.post("adjudicate", group).await
    }
}
