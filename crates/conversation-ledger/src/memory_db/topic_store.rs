use crate::error::{LedgerError, LedgerResult};
use crate::memory_db::schema::*;
use crate::memory_db::{DbPool, PooledConnection};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct TopicStore {
    pool: Arc<DbPool>,
}

impl TopicStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> LedgerResult<PooledConnection> {
        Ok(self.pool.get()?)
    }

    pub fn get(&self, id: &str) -> LedgerResult<Topic> {
        let conn = self.get_conn()?;
        get_topic_with_conn(&conn, id)?.ok_or_else(|| LedgerError::not_found(format!("topic {}", id)))
    }

    pub fn list_for_user(&self, user_id: &str) -> LedgerResult<Vec<Topic>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, range_start, range_end, created_at
             FROM topics WHERE user_id = ?1 ORDER BY range_start",
        )?;
        let topics = stmt
            .query_map([user_id], row_to_topic)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(topics)
    }

    /// Removes the topic; its memory links cascade and its messages lose their tag.
    pub fn delete(&self, id: &str) -> LedgerResult<()> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM topics WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(LedgerError::not_found(format!("topic {}", id)));
        }
        info!("Deleted topic {}", id);
        Ok(())
    }
}

pub fn create_topic_with_conn(
    conn: &Connection,
    user_id: &str,
    name: &str,
    range_start: i64,
    range_end: i64,
) -> LedgerResult<Topic> {
    let topic = Topic {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        name: name.to_string(),
        range_start,
        range_end,
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO topics (id, user_id, name, range_start, range_end, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            topic.id,
            topic.user_id,
            topic.name,
            topic.range_start,
            topic.range_end,
            format_timestamp(&topic.created_at)
        ],
    )?;
    Ok(topic)
}

/// Widens the topic range so it covers `start..=end`.
pub fn extend_topic_with_conn(conn: &Connection, id: &str, start: i64, end: i64) -> LedgerResult<()> {
    let updated = conn.execute(
        "UPDATE topics SET range_start = MIN(range_start, ?2), range_end = MAX(range_end, ?3)
         WHERE id = ?1",
        params![id, start, end],
    )?;
    if updated == 0 {
        return Err(LedgerError::not_found(format!("topic {}", id)));
    }
    Ok(())
}

pub fn get_topic_with_conn(conn: &Connection, id: &str) -> LedgerResult<Option<Topic>> {
    let topic = conn
        .query_row(
            "SELECT id, user_id, name, range_start, range_end, created_at FROM topics WHERE id = ?1",
            [id],
            row_to_topic,
        )
        .optional()?;
    Ok(topic)
}

/// Topic of the active message directly before `sequence`, if that message is tagged.
pub fn preceding_topic_with_conn(
    conn: &Connection,
    user_id: &str,
    sequence: i64,
) -> LedgerResult<Option<Topic>> {
    let topic_id: Option<Option<String>> = conn
        .query_row(
            "SELECT topic_id FROM messages
             WHERE user_id = ?1 AND superseded = 0 AND sequence < ?2
             ORDER BY sequence DESC LIMIT 1",
            params![user_id, sequence],
            |row| row.get(0),
        )
        .optional()?;
    match topic_id.flatten() {
        Some(id) => get_topic_with_conn(conn, &id),
        None => Ok(None),
    }
}

fn row_to_topic(row: &Row) -> rusqlite::Result<Topic> {
    let created_at: String = row.get(5)?;
    Ok(Topic {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        range_start: row.get(3)?,
        range_end: row.get(4)?,
        created_at: read_timestamp(&created_at)?,
    })
}
