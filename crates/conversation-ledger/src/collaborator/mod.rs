//! Reasoning collaborator - the external service that names topics,
//! extracts memories and adjudicates duplicate groups.
//!
//! Payloads come back as raw JSON and are validated on this side by
//! [`payload`] before anything is written.

pub mod http;
pub mod payload;

pub use http::HttpReasoningClient;
pub use payload::{Classification, ExtractedMemory, MergeDecision, MergePlan};

use crate::config::Config;
use crate::error::{LedgerError, LedgerResult};
use crate::memory_db::Role;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpanMessage {
    pub sequence: i64,
    pub role: Role,
    pub content: String,
}

/// Contiguous run of untagged messages sent for classification.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageSpan {
    pub user_id: String,
    pub start: i64,
    pub end: i64,
    pub preceding_topic: Option<String>,
    pub messages: Vec<SpanMessage>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CandidateMemory {
    pub id: i64,
    pub text: String,
    pub tags: Vec<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CandidateGroup {
    pub priority: f64,
    pub members: Vec<CandidateMemory>,
}

#[async_trait]
pub trait ReasoningCollaborator: Send + Sync {
    /// Returns `{topic_name, memories: [{text, tags, category}]}`.
    async fn classify(&self, span: &MessageSpan) -> LedgerResult<serde_json::Value>;

    /// Returns `{merges: [{keep_id, absorb_ids, text, tags, category}]}`.
    async fn adjudicate(&self, group: &CandidateGroup) -> LedgerResult<serde_json::Value>;
}

/// Stand-in used when no collaborator is configured.
pub struct DisabledCollaborator;

#[async_trait]
impl ReasoningCollaborator for DisabledCollaborator {
    async fn classify(&self, _span: &MessageSpan) -> LedgerResult<serde_json::Value> {
        Err(LedgerError::CollaboratorUnavailable("no reasoning collaborator configured".into()))
    }

    async fn adjudicate(&self, _group: &CandidateGroup) -> LedgerResult<serde_json::Value> {
        Err(LedgerError::CollaboratorUnavailable("no reasoning collaborator configured".into()))
    }
}

pub fn from_config(config: &Config) -> LedgerResult<Arc<dyn ReasoningCollaborator>> {
    let collaborator: Arc<dyn ReasoningCollaborator> = match config.reasoning_url.as_deref() {
        Some(url) => Arc::new(HttpReasoningClient::new(url, config.collaborator_timeout())?),
        None => Arc::new(DisabledCollaborator),
    };
    Ok(collaborator)
}

/// Runs one collaborator call under `timeout`.
pub async fn call_once<T, Fut>(label: &str, timeout: Duration, call: Fut) -> LedgerResult<T>
where
    Fut: Future<Output = LedgerResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::CollaboratorUnavailable(format!(
            "{} timed out after {:?}",
            label, timeout
        ))),
    }
}

/// Runs `call` under `timeout`, retrying once when the failure is retryable.
pub async fn call_with_retry<T, F, Fut>(label: &str, timeout: Duration, mut call: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    const ATTEMPTS: usize = 2;
    let mut last_error = None;

    for attempt in 1..=ATTEMPTS {
        match call_once(label, timeout, call()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < ATTEMPTS => {
                warn!("{} failed (attempt {}): {}; retrying", label, attempt, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| LedgerError::CollaboratorUnavailable(label.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_recovers_from_one_failure() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = call_with_retry("classify", Duration::from_secs(1), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LedgerError::CollaboratorUnavailable("boom".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_second_failure() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: LedgerResult<()> = call_with_retry("adjudicate", Duration::from_secs(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::CollaboratorUnavailable("down".into()))
        })
        .await;
        assert!(matches!(result, Err(LedgerError::CollaboratorUnavailable(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: LedgerResult<()> = call_with_retry("classify", Duration::from_secs(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::validation("bad payload"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_unavailable() {
        let result: LedgerResult<()> = call_with_retry("classify", Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        match result {
            Err(LedgerError::CollaboratorUnavailable(message)) => assert!(message.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_once_never_retries() {
        let counter = AtomicUsize::new(0);
        let result: LedgerResult<()> = call_once("adjudicate", Duration::from_secs(1), async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::CollaboratorUnavailable("down".into()))
        })
        .await;
        assert!(matches!(result, Err(LedgerError::CollaboratorUnavailable(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_collaborator_is_unavailable() {
        let span = MessageSpan {
            user_id: "alice".into(),
            start: 1,
            end: 2,
            preceding_topic: None,
            messages: Vec::new(),
        };
        assert!(matches!(
            DisabledCollaborator.classify(&span).await,
            Err(LedgerError::CollaboratorUnavailable(_))
        ));
    }
}
