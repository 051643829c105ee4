use crate::error::LedgerResult;
use crate::memory_db::schema::*;
use crate::memory_db::{DbPool, PooledConnection};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::Arc;

/// Persisted heatmap state: keyword scores plus the derived per-memory cache.
pub struct HeatmapStore {
    pool: Arc<DbPool>,
}

impl HeatmapStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> LedgerResult<PooledConnection> {
        Ok(self.pool.get()?)
    }

    pub fn load_keywords(&self) -> LedgerResult<Vec<KeywordScoreRow>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT keyword, score, last_updated FROM heatmap_keywords ORDER BY keyword")?;
        let rows = stmt
            .query_map([], |row| {
                let last_updated: String = row.get(2)?;
                Ok(KeywordScoreRow {
                    keyword: row.get(0)?,
                    score: row.get(1)?,
                    last_updated: read_timestamp(&last_updated)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Highest cached memory scores, ties broken by memory id.
    pub fn top_memory_scores(&self, limit: usize) -> LedgerResult<Vec<(i64, f64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT memory_id, score FROM heatmap_memory_scores
             ORDER BY score DESC, memory_id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub(crate) fn memory_score(&self, memory_id: i64) -> LedgerResult<Option<f64>> {
        use rusqlite::OptionalExtension;
        let conn = self.get_conn()?;
        let score = conn
            .query_row(
                "SELECT score FROM heatmap_memory_scores WHERE memory_id = ?1",
                [memory_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score)
    }
}

pub fn replace_keywords_with_conn(conn: &Connection, rows: &[KeywordScoreRow]) -> LedgerResult<()> {
    conn.execute("DELETE FROM heatmap_keywords", [])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO heatmap_keywords (keyword, score, last_updated) VALUES (?1, ?2, ?3)",
    )?;
    for row in rows {
        stmt.execute(params![row.keyword, row.score, format_timestamp(&row.last_updated)])?;
    }
    Ok(())
}

/// Rewrites the memory-score cache. Memories scoring zero get no row.
pub fn replace_memory_scores_with_conn(
    conn: &Connection,
    scores: &[(i64, f64)],
    now: &DateTime<Utc>,
) -> LedgerResult<()> {
    conn.execute("DELETE FROM heatmap_memory_scores", [])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO heatmap_memory_scores (memory_id, score, updated_at) VALUES (?1, ?2, ?3)",
    )?;
    let now = format_timestamp(now);
    for (memory_id, score) in scores.iter().filter(|(_, score)| *score > 0.0) {
        stmt.execute(params![memory_id, score, now])?;
    }
    Ok(())
}
