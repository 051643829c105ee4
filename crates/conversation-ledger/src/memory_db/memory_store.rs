use crate::error::{LedgerError, LedgerResult};
use crate::memory_db::schema::*;
use crate::memory_db::{DbPool, PooledConnection};
use crate::utils::TextUtils;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Content of a memory as written by callers, before normalisation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewMemory {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
}

impl NewMemory {
    /// Trims text and category, normalises tags and rejects empty required fields.
    pub fn normalized(&self) -> LedgerResult<NewMemory> {
        let text = self.text.trim();
        if text.is_empty() {
            return Err(LedgerError::validation("memory text must not be empty"));
        }
        let tags = TextUtils::normalize_tags(&self.tags);
        if tags.is_empty() {
            return Err(LedgerError::validation("a memory needs at least one tag"));
        }
        let category = match self.category.as_deref().map(str::trim) {
            Some("") => return Err(LedgerError::validation("category must not be empty when present")),
            other => other.map(str::to_string),
        };
        Ok(NewMemory {
            text: text.to_string(),
            tags,
            category,
            topic_id: self
                .topic_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        })
    }
}

/// One (memory, tag) pair of the tag index.
#[derive(Debug, Clone, PartialEq)]
pub struct TagPosting {
    pub memory_id: i64,
    pub tag: String,
    pub reviewed: bool,
}

pub struct MemoryStore {
    pool: Arc<DbPool>,
}

impl MemoryStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> LedgerResult<PooledConnection> {
        Ok(self.pool.get()?)
    }

    pub fn create(&self, memory: &NewMemory) -> LedgerResult<i64> {
        let memory = memory.normalized()?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = insert_memory_with_conn(&tx, &memory)?;
        tx.commit()?;
        info!("Created memory {} with {} tags", id, memory.tags.len());
        Ok(id)
    }

    /// Replaces text, tags and category. Topic links are left alone.
    pub fn update(&self, id: i64, memory: &NewMemory) -> LedgerResult<MemoryEntry> {
        let memory = memory.normalized()?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        update_memory_with_conn(&tx, id, &memory.text, &memory.tags, memory.category.as_deref())?;
        let entry = load_memory_with_conn(&tx, id)?
            .ok_or_else(|| LedgerError::not_found(format!("memory {}", id)))?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn delete(&self, id: i64) -> LedgerResult<()> {
        let conn = self.get_conn()?;
        if !delete_memory_with_conn(&conn, id)? {
            return Err(LedgerError::not_found(format!("memory {}", id)));
        }
        info!("Deleted memory {}", id);
        Ok(())
    }

    /// Full entry; counts as an access.
    pub fn get(&self, id: i64) -> LedgerResult<MemoryEntry> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let touched = tx.execute(
            "UPDATE memories SET access_count = access_count + 1, last_accessed = ?2 WHERE id = ?1",
            params![id, format_timestamp(&Utc::now())],
        )?;
        if touched == 0 {
            return Err(LedgerError::not_found(format!("memory {}", id)));
        }
        let entry = load_memory_with_conn(&tx, id)?
            .ok_or_else(|| LedgerError::not_found(format!("memory {}", id)))?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn link_topic(&self, memory_id: i64, topic_id: &str) -> LedgerResult<()> {
        let conn = self.get_conn()?;
        link_topic_with_conn(&conn, memory_id, topic_id)
    }

    pub fn unlink_topic(&self, memory_id: i64, topic_id: &str) -> LedgerResult<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM memory_topics WHERE memory_id = ?1 AND topic_id = ?2",
            params![memory_id, topic_id],
        )?;
        Ok(removed > 0)
    }

    /// Entries for `ids` without touching access statistics, in the order given.
    pub fn load_many(&self, ids: &[i64]) -> LedgerResult<Vec<MemoryEntry>> {
        let conn = self.get_conn()?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = load_memory_with_conn(&conn, *id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn tag_postings(&self) -> LedgerResult<Vec<TagPosting>> {
        let conn = self.get_conn()?;
        tag_postings_with_conn(&conn)
    }

    pub fn count(&self) -> LedgerResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn ensure_topic_exists(conn: &Connection, topic_id: &str) -> LedgerResult<()> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM topics WHERE id = ?1", [topic_id], |row| row.get(0))
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(LedgerError::not_found(format!("topic {}", topic_id))),
    }
}

/// Inserts an already normalised memory together with its tags and optional topic link.
pub fn insert_memory_with_conn(conn: &Connection, memory: &NewMemory) -> LedgerResult<i64> {
    if let Some(topic_id) = memory.topic_id.as_deref() {
        ensure_topic_exists(conn, topic_id)?;
    }
    conn.execute(
        "INSERT INTO memories (text, category, created_at) VALUES (?1, ?2, ?3)",
        params![memory.text, memory.category, format_timestamp(&Utc::now())],
    )?;
    let id = conn.last_insert_rowid();
    replace_tags_with_conn(conn, id, &memory.tags)?;
    if let Some(topic_id) = memory.topic_id.as_deref() {
        conn.execute(
            "INSERT OR IGNORE INTO memory_topics (memory_id, topic_id) VALUES (?1, ?2)",
            params![id, topic_id],
        )?;
    }
    Ok(id)
}

pub fn update_memory_with_conn(
    conn: &Connection,
    id: i64,
    text: &str,
    tags: &[String],
    category: Option<&str>,
) -> LedgerResult<()> {
    let updated = conn.execute(
        "UPDATE memories SET text = ?2, category = ?3, reviewed = 0 WHERE id = ?1",
        params![id, text, category],
    )?;
    if updated == 0 {
        return Err(LedgerError::not_found(format!("memory {}", id)));
    }
    replace_tags_with_conn(conn, id, tags)?;
    debug!("Updated memory {}", id);
    Ok(())
}

fn replace_tags_with_conn(conn: &Connection, id: i64, tags: &[String]) -> LedgerResult<()> {
    conn.execute("DELETE FROM memory_tags WHERE memory_id = ?1", [id])?;
    let mut stmt = conn.prepare_cached("INSERT OR IGNORE INTO memory_tags (memory_id, tag) VALUES (?1, ?2)")?;
    for tag in tags {
        stmt.execute(params![id, tag])?;
    }
    Ok(())
}

/// Returns whether a row was removed; tags, topic links and cached scores cascade.
pub fn delete_memory_with_conn(conn: &Connection, id: i64) -> LedgerResult<bool> {
    let deleted = conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;
    Ok(deleted > 0)
}

pub fn link_topic_with_conn(conn: &Connection, memory_id: i64, topic_id: &str) -> LedgerResult<()> {
    ensure_topic_exists(conn, topic_id)?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM memories WHERE id = ?1", [memory_id], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(LedgerError::not_found(format!("memory {}", memory_id)));
    }
    conn.execute(
        "INSERT OR IGNORE INTO memory_topics (memory_id, topic_id) VALUES (?1, ?2)",
        params![memory_id, topic_id],
    )?;
    Ok(())
}

/// Copies every topic link of `from` onto `to`.
pub fn copy_topic_links_with_conn(conn: &Connection, from: i64, to: i64) -> LedgerResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO memory_topics (memory_id, topic_id)
         SELECT ?2, topic_id FROM memory_topics WHERE memory_id = ?1",
        params![from, to],
    )?;
    Ok(())
}

pub fn mark_reviewed_with_conn(conn: &Connection, ids: &[i64]) -> LedgerResult<()> {
    let mut stmt = conn.prepare_cached("UPDATE memories SET reviewed = 1 WHERE id = ?1")?;
    for id in ids {
        stmt.execute([id])?;
    }
    Ok(())
}

pub fn load_memory_with_conn(conn: &Connection, id: i64) -> LedgerResult<Option<MemoryEntry>> {
    let entry = conn
        .query_row(
            "SELECT id, text, category, created_at, access_count, last_accessed, reviewed
             FROM memories WHERE id = ?1",
            [id],
            row_to_memory,
        )
        .optional()?;

    match entry {
        Some(mut entry) => {
            entry.tags = load_tags_with_conn(conn, id)?;
            entry.topic_ids = load_topic_ids_with_conn(conn, id)?;
            Ok(Some(entry))
        }
        None => Ok(None),
    }
}

fn load_tags_with_conn(conn: &Connection, id: i64) -> LedgerResult<Vec<String>> {
    let mut stmt = conn.prepare_cached("SELECT tag FROM memory_tags WHERE memory_id = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(tags)
}

fn load_topic_ids_with_conn(conn: &Connection, id: i64) -> LedgerResult<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT topic_id FROM memory_topics WHERE memory_id = ?1 ORDER BY topic_id")?;
    let topics = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(topics)
}

pub fn tag_postings_with_conn(conn: &Connection) -> LedgerResult<Vec<TagPosting>> {
    let mut stmt = conn.prepare(
        "SELECT mt.memory_id, mt.tag, m.reviewed
         FROM memory_tags mt JOIN memories m ON m.id = mt.memory_id
         ORDER BY mt.memory_id, mt.tag",
    )?;
    let postings = stmt
        .query_map([], |row| {
            Ok(TagPosting {
                memory_id: row.get(0)?,
                tag: row.get(1)?,
                reviewed: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(postings)
}

fn row_to_memory(row: &Row) -> rusqlite::Result<MemoryEntry> {
    let created_at: String = row.get(3)?;
    let last_accessed: Option<String> = row.get(5)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        text: row.get(1)?,
        category: row.get(2)?,
        tags: Vec::new(),
        topic_ids: Vec::new(),
        created_at: read_timestamp(&created_at)?,
        access_count: row.get(4)?,
        last_accessed: last_accessed.as_deref().map(read_timestamp).transpose()?,
        reviewed: row.get(6)?,
    })
}
