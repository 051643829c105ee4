use crate::error::LedgerResult;
use crate::memory_db::schema::*;
use crate::memory_db::{DbPool, PooledConnection};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info};

const MESSAGE_COLUMNS: &str = "id, user_id, sequence, platform, platform_msg_id, role, content, content_hash,
     tool_calls, function_call, tool_call_id, topic_id, sent_at, created_at, superseded";

/// Insert parameters for one buffer row.
pub struct NewMessage<'a> {
    pub user_id: &'a str,
    pub platform: &'a str,
    pub platform_msg_id: Option<&'a str>,
    pub role: Role,
    pub content: &'a str,
    pub tool_calls: Option<&'a serde_json::Value>,
    pub function_call: Option<&'a serde_json::Value>,
    pub tool_call_id: Option<&'a str>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Durable per-user ordered message sequence.
pub struct MessageStore {
    pool: Arc<DbPool>,
}

impl MessageStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> LedgerResult<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Active buffer in sequence order, optionally paged.
    pub fn get_buffer(
        &self,
        user_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> LedgerResult<Vec<CanonicalMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE user_id = ?1 AND superseded = 0
             ORDER BY sequence LIMIT ?2 OFFSET ?3"
        ))?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let offset = offset.unwrap_or(0) as i64;
        let rows = stmt
            .query_map(params![user_id, limit, offset], row_to_canonical)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_active(&self, user_id: &str) -> LedgerResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE user_id = ?1 AND superseded = 0",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Deletes buffer rows created within the inclusive range, then supersedes
    /// leading non-user rows so the buffer still opens with a user turn.
    pub fn purge_range(
        &self,
        user_id: &str,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> LedgerResult<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let deleted = tx.execute(
            "DELETE FROM messages WHERE user_id = ?1 AND created_at >= ?2 AND created_at <= ?3",
            params![user_id, format_timestamp(from), format_timestamp(to)],
        )?;
        let stripped = strip_leading_non_user_with_conn(&tx, user_id)?;
        tx.commit()?;

        info!(
            "Purged {} messages for user {} ({} leading rows superseded)",
            deleted, user_id, stripped
        );
        Ok(deleted)
    }
}

/// The last `window` rows for the user, superseded rows included, in sequence order.
pub fn tail_window_with_conn(
    conn: &Connection,
    user_id: &str,
    window: usize,
) -> LedgerResult<Vec<CanonicalMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM (
             SELECT * FROM messages WHERE user_id = ?1 ORDER BY sequence DESC LIMIT ?2
         ) ORDER BY sequence"
    ))?;
    let rows = stmt
        .query_map(params![user_id, window as i64], row_to_canonical)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn active_buffer_with_conn(conn: &Connection, user_id: &str) -> LedgerResult<Vec<CanonicalMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE user_id = ?1 AND superseded = 0 ORDER BY sequence"
    ))?;
    let rows = stmt
        .query_map([user_id], row_to_canonical)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Last active row of the buffer.
pub fn active_tail_with_conn(conn: &Connection, user_id: &str) -> LedgerResult<Option<CanonicalMessage>> {
    let tail = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE user_id = ?1 AND superseded = 0 ORDER BY sequence DESC LIMIT 1"
            ),
            [user_id],
            row_to_canonical,
        )
        .optional()?;
    Ok(tail)
}

/// Rows older than `before_sequence` sharing the platform id or role-qualified
/// fingerprint of a message. Callers decide which candidate actually matches.
pub fn history_candidates_with_conn(
    conn: &Connection,
    user_id: &str,
    before_sequence: i64,
    platform_msg_id: Option<&str>,
    content_hash: &str,
) -> LedgerResult<Vec<CanonicalMessage>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE user_id = ?1 AND sequence < ?2
           AND ((?3 IS NOT NULL AND platform_msg_id = ?3) OR content_hash = ?4)
         ORDER BY sequence DESC LIMIT 20"
    ))?;
    let rows = stmt
        .query_map(params![user_id, before_sequence, platform_msg_id, content_hash], row_to_canonical)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_message_with_conn(conn: &Connection, id: i64) -> LedgerResult<Option<CanonicalMessage>> {
    let message = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [id],
            row_to_canonical,
        )
        .optional()?;
    Ok(message)
}

pub fn insert_message_with_conn(conn: &Connection, message: NewMessage<'_>) -> LedgerResult<CanonicalMessage> {
    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE user_id = ?1",
        [message.user_id],
        |row| row.get(0),
    )?;
    let now = Utc::now();
    let content_hash = content_fingerprint(message.role, message.content);
    let tool_calls = message.tool_calls.map(serde_json::to_string).transpose()?;
    let function_call = message.function_call.map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO messages
         (user_id, sequence, platform, platform_msg_id, role, content, content_hash,
          tool_calls, function_call, tool_call_id, sent_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            message.user_id,
            sequence,
            message.platform,
            message.platform_msg_id,
            message.role.as_str(),
            message.content,
            &content_hash,
            tool_calls,
            function_call,
            message.tool_call_id,
            message.sent_at.as_ref().map(format_timestamp),
            format_timestamp(&now),
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!("Appended message {} (seq {}) for user {}", id, sequence, message.user_id);

    Ok(CanonicalMessage {
        id,
        user_id: message.user_id.to_string(),
        sequence,
        platform: message.platform.to_string(),
        platform_msg_id: message.platform_msg_id.map(str::to_string),
        role: message.role,
        content: message.content.to_string(),
        content_hash,
        tool_calls: message.tool_calls.cloned(),
        function_call: message.function_call.cloned(),
        tool_call_id: message.tool_call_id.map(str::to_string),
        topic_id: None,
        sent_at: message.sent_at,
        created_at: now,
        superseded: false,
    })
}

/// Edit-in-place for an assistant row: content and tool-call metadata are replaced together.
pub fn update_assistant_content_with_conn(
    conn: &Connection,
    id: i64,
    content: &str,
    tool_calls: Option<&serde_json::Value>,
    function_call: Option<&serde_json::Value>,
) -> LedgerResult<usize> {
    let tool_calls = tool_calls.map(serde_json::to_string).transpose()?;
    let function_call = function_call.map(serde_json::to_string).transpose()?;
    let updated = conn.execute(
        "UPDATE messages SET content = ?2, content_hash = ?3,
             tool_calls = COALESCE(?4, tool_calls), function_call = COALESCE(?5, function_call)
         WHERE id = ?1 AND role = 'assistant'",
        params![
            id,
            content,
            content_fingerprint(Role::Assistant, content),
            tool_calls,
            function_call
        ],
    )?;
    Ok(updated)
}

pub fn set_platform_msg_id_with_conn(conn: &Connection, id: i64, platform_msg_id: &str) -> LedgerResult<()> {
    conn.execute(
        "UPDATE messages SET platform_msg_id = ?2 WHERE id = ?1 AND platform_msg_id IS NULL",
        params![id, platform_msg_id],
    )?;
    Ok(())
}

pub fn supersede_with_conn(conn: &Connection, id: i64) -> LedgerResult<()> {
    conn.execute("UPDATE messages SET superseded = 1 WHERE id = ?1", [id])?;
    Ok(())
}

/// Supersedes active rows that precede the first active user row.
pub fn strip_leading_non_user_with_conn(conn: &Connection, user_id: &str) -> LedgerResult<usize> {
    let stripped = conn.execute(
        "UPDATE messages SET superseded = 1
         WHERE user_id = ?1 AND superseded = 0 AND role != 'user'
           AND sequence < COALESCE(
               (SELECT MIN(sequence) FROM messages
                WHERE user_id = ?1 AND superseded = 0 AND role = 'user'),
               9223372036854775807)",
        [user_id],
    )?;
    Ok(stripped)
}

/// Tags every active row of `user_id` with a sequence in `start..=end`.
pub fn set_topic_for_range_with_conn(
    conn: &Connection,
    user_id: &str,
    topic_id: &str,
    start: i64,
    end: i64,
) -> LedgerResult<usize> {
    let tagged = conn.execute(
        "UPDATE messages SET topic_id = ?2
         WHERE user_id = ?1 AND superseded = 0 AND sequence >= ?3 AND sequence <= ?4",
        params![user_id, topic_id, start, end],
    )?;
    Ok(tagged)
}

/// Active rows in `start..=end` that no topic has claimed yet.
pub fn untagged_in_range_with_conn(conn: &Connection, user_id: &str, start: i64, end: i64) -> LedgerResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE user_id = ?1 AND superseded = 0 AND topic_id IS NULL AND sequence >= ?2 AND sequence <= ?3",
        params![user_id, start, end],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Active rows in `start..=end`, and how many of them carry a topic other than `topic_id`.
pub fn range_summary_with_conn(
    conn: &Connection,
    user_id: &str,
    start: i64,
    end: i64,
    topic_id: &str,
) -> LedgerResult<(usize, usize)> {
    let (active, foreign): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(topic_id IS NOT NULL AND topic_id != ?4), 0) FROM messages
         WHERE user_id = ?1 AND superseded = 0 AND sequence >= ?2 AND sequence <= ?3",
        params![user_id, start, end, topic_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((active as usize, foreign as usize))
}

pub(crate) fn row_to_canonical(row: &Row) -> rusqlite::Result<CanonicalMessage> {
    let role_raw: String = row.get(5)?;
    let role = Role::parse(&role_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.to_string().into())
    })?;
    let tool_calls: Option<String> = row.get(8)?;
    let function_call: Option<String> = row.get(9)?;
    let sent_at: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;

    Ok(CanonicalMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        sequence: row.get(2)?,
        platform: row.get(3)?,
        platform_msg_id: row.get(4)?,
        role,
        content: row.get(6)?,
        content_hash: row.get(7)?,
        tool_calls: tool_calls.as_deref().map(parse_json_column).transpose()?,
        function_call: function_call.as_deref().map(parse_json_column).transpose()?,
        tool_call_id: row.get(10)?,
        topic_id: row.get(11)?,
        sent_at: sent_at.as_deref().map(read_timestamp).transpose()?,
        created_at: read_timestamp(&created_at)?,
        superseded: row.get(14)?,
    })
}

fn parse_json_column(raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
