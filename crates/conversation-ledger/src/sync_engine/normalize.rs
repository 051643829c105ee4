//! Ingestion-side validation and batch normalisation

use crate::error::{LedgerError, LedgerResult};
use crate::memory_db::{content_fingerprint, NewMessage, RawMessage, Role};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

pub const MAX_BATCH_MESSAGES: usize = 1000;
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

lazy_static! {
    static ref USER_ID_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,256}$").unwrap();
}

pub fn validate_user_id(user_id: &str) -> LedgerResult<()> {
    if USER_ID_REGEX.is_match(user_id) {
        Ok(())
    } else {
        Err(LedgerError::validation(format!(
            "user_id must be 1-256 characters of [A-Za-z0-9_-], got '{}'",
            user_id.chars().take(64).collect::<String>()
        )))
    }
}

/// A validated batch entry, ready for alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub role: Role,
    pub content: String,
    pub content_hash: String,
    pub platform: String,
    pub platform_msg_id: Option<String>,
    pub tool_calls: Option<serde_json::Value>,
    pub function_call: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl IncomingMessage {
    pub fn from_raw(index: usize, raw: &RawMessage) -> LedgerResult<Self> {
        let at = |detail: String| LedgerError::validation(format!("message {}: {}", index, detail));

        let role = Role::parse(&raw.role).map_err(|e| at(e.to_string()))?;
        if raw.content.len() > MAX_CONTENT_BYTES {
            return Err(at(format!("content exceeds {} bytes", MAX_CONTENT_BYTES)));
        }
        if raw.content.contains('\0') {
            return Err(at("content contains a NUL character".to_string()));
        }
        let platform = raw.platform.trim();
        if platform.is_empty() {
            return Err(at("platform is required".to_string()));
        }
        let sent_at = match raw.timestamp.as_deref().map(str::trim).filter(|ts| !ts.is_empty()) {
            Some(ts) => Some(
                DateTime::parse_from_rfc3339(ts)
                    .map_err(|e| at(format!("timestamp '{}' is not RFC 3339: {}", ts, e)))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        Ok(Self {
            role,
            content_hash: content_fingerprint(role, &raw.content),
            content: raw.content.clone(),
            platform: platform.to_string(),
            platform_msg_id: non_empty(raw.platform_msg_id.as_deref()),
            tool_calls: raw.tool_calls.clone().filter(|v| !v.is_null()),
            function_call: raw.function_call.clone().filter(|v| !v.is_null()),
            tool_call_id: non_empty(raw.tool_call_id.as_deref()),
            sent_at,
        })
    }

    pub fn as_new<'a>(&'a self, user_id: &'a str) -> NewMessage<'a> {
        NewMessage {
            user_id,
            platform: &self.platform,
            platform_msg_id: self.platform_msg_id.as_deref(),
            role: self.role,
            content: &self.content,
            tool_calls: self.tool_calls.as_ref(),
            function_call: self.function_call.as_ref(),
            tool_call_id: self.tool_call_id.as_deref(),
            sent_at: self.sent_at,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Validates every entry and collapses runs of identical adjacent user messages,
/// keeping the first and borrowing a platform id from a duplicate when it has none.
pub fn normalize_batch(batch: &[RawMessage]) -> LedgerResult<Vec<IncomingMessage>> {
    if batch.len() > MAX_BATCH_MESSAGES {
        return Err(LedgerError::validation(format!(
            "batch of {} messages exceeds the limit of {}",
            batch.len(),
            MAX_BATCH_MESSAGES
        )));
    }

    let mut normalized: Vec<IncomingMessage> = Vec::with_capacity(batch.len());
    for (index, raw) in batch.iter().enumerate() {
        let message = IncomingMessage::from_raw(index, raw)?;
        if let Some(previous) = normalized.last_mut() {
            if previous.role == Role::User && message.role == Role::User && previous.content == message.content {
                if previous.platform_msg_id.is_none() {
                    previous.platform_msg_id = message.platform_msg_id;
                }
                continue;
            }
        }
        normalized.push(message);
    }
    Ok(normalized)
}
