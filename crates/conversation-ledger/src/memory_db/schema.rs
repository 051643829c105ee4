//! Row types and timestamp conventions for the ledger database
use crate::error::{LedgerError, LedgerResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message author role. The set is closed; anything else is rejected at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> LedgerResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(LedgerError::validation(format!("unknown role '{}'", other))),
        }
    }

    /// User and assistant turns make up the dialogue; system and tool rows ride along.
    pub fn is_turn(&self) -> bool {
        matches!(self, Role::User | Role::Assistant)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as delivered by a platform bridge, before reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    pub platform: String,
    #[serde(default)]
    pub platform_msg_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<serde_json::Value>,
    #[serde(default)]
    pub function_call: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// The stored, deduplicated representation of a platform message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalMessage {
    pub id: i64,
    pub user_id: String,
    pub sequence: i64,
    pub platform: String,
    pub platform_msg_id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(skip)]
    pub content_hash: String,
    pub tool_calls: Option<serde_json::Value>,
    pub function_call: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
    pub topic_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub superseded: bool,
}

/// A durable knowledge unit with its tags, topic links and access statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: i64,
    pub text: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub topic_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub reviewed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub range_start: i64,
    pub range_end: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordScoreRow {
    pub keyword: String,
    pub score: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_users: i64,
    pub total_messages: i64,
    pub superseded_messages: i64,
    pub total_memories: i64,
    pub total_topics: i64,
    pub active_keywords: i64,
    pub database_size_bytes: i64,
}

/// Fixed-width UTC form so that lexical comparison in SQL matches time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

/// Parses a caller-supplied ISO-8601 value, reporting failures as validation errors.
pub fn parse_filter_timestamp(field: &str, raw: &str) -> LedgerResult<DateTime<Utc>> {
    parse_timestamp(raw.trim())
        .ok_or_else(|| LedgerError::validation(format!("{} is not a valid ISO-8601 timestamp: '{}'", field, raw)))
}

pub(crate) fn read_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unparseable timestamp '{}'", raw).into(),
        )
    })
}

/// Role-qualified content digest used for fallback alignment.
pub fn content_fingerprint(role: Role, content: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(role.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}
