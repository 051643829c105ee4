//! Multi-filter memory search.
//!
//! Every supplied filter narrows the result set. Keyword matching counts the
//! shared tags per memory; when nothing reaches `min_keywords` the threshold is
//! lowered one step at a time down to a single shared tag.

use crate::error::{LedgerError, LedgerResult};
use crate::memory_db::memory_store::load_memory_with_conn;
use crate::memory_db::{format_timestamp, parse_filter_timestamp, MemoryDatabase, MemoryEntry};
use crate::utils::TextUtils;
use rusqlite::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_SEARCH_LIMIT: usize = 50;
pub const MAX_SEARCH_LIMIT: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilters {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub min_keywords: Option<usize>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    #[serde(default)]
    pub created_after: Option<String>,
    #[serde(default)]
    pub created_before: Option<String>,
    #[serde(default)]
    pub memory_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchOutcome {
    pub memories: Vec<MemoryEntry>,
    /// Shared-tag threshold that produced `memories`; absent without keywords.
    pub min_keywords: Option<usize>,
}

/// Filters after parsing and normalisation.
#[derive(Debug)]
struct ResolvedFilters {
    keywords: Vec<String>,
    min_keywords: Option<usize>,
    category: Option<String>,
    topic_id: Option<String>,
    created_after: Option<String>,
    created_before: Option<String>,
    limit: usize,
}

impl SearchFilters {
    fn resolve(&self) -> LedgerResult<ResolvedFilters> {
        let keywords = TextUtils::normalize_tags(&self.keywords);
        if keywords.is_empty() && !self.keywords.is_empty() {
            return Err(LedgerError::validation("keywords contain no usable tag"));
        }

        let min_keywords = if keywords.is_empty() {
            None
        } else {
            match self.min_keywords {
                Some(0) => return Err(LedgerError::validation("min_keywords must be at least 1")),
                Some(n) => Some(n.min(keywords.len())),
                None => Some(1),
            }
        };

        let after = self
            .created_after
            .as_deref()
            .map(|raw| parse_filter_timestamp("created_after", raw))
            .transpose()?;
        let before = self
            .created_before
            .as_deref()
            .map(|raw| parse_filter_timestamp("created_before", raw))
            .transpose()?;
        if let (Some(a), Some(b)) = (after, before) {
            if a > b {
                return Err(LedgerError::validation("created_after is later than created_before"));
            }
        }

        let limit = match self.limit {
            Some(0) => return Err(LedgerError::validation("limit must be at least 1")),
            Some(n) => n.min(MAX_SEARCH_LIMIT),
            None => DEFAULT_SEARCH_LIMIT,
        };

        Ok(ResolvedFilters {
            keywords,
            min_keywords,
            category: self
                .category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            topic_id: self.topic_id.clone(),
            created_after: after.map(|ts| format_timestamp(&ts)),
            created_before: before.map(|ts| format_timestamp(&ts)),
            limit,
        })
    }
}

pub struct MemorySearch {
    db: Arc<MemoryDatabase>,
}

impl MemorySearch {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self { db }
    }

    pub fn search(&self, filters: &SearchFilters) -> LedgerResult<SearchOutcome> {
        let conn = self.db.get_conn()?;

        if let Some(id) = filters.memory_id {
            let memories = load_memory_with_conn(&conn, id)?.into_iter().collect();
            return Ok(SearchOutcome {
                memories,
                min_keywords: None,
            });
        }

        let resolved = filters.resolve()?;
        let Some(requested) = resolved.min_keywords else {
            let ids = matching_ids(&conn, &resolved, 0)?;
            return Ok(SearchOutcome {
                memories: load_entries(&conn, &ids)?,
                min_keywords: None,
            });
        };

        for threshold in (1..=requested).rev() {
            let ids = matching_ids(&conn, &resolved, threshold)?;
            if !ids.is_empty() {
                if threshold < requested {
                    debug!("Relaxed min_keywords from {} to {}", requested, threshold);
                }
                return Ok(SearchOutcome {
                    memories: load_entries(&conn, &ids)?,
                    min_keywords: Some(threshold),
                });
            }
        }

        Ok(SearchOutcome {
            memories: Vec::new(),
            min_keywords: Some(1),
        })
    }
}

fn matching_ids(conn: &Connection, filters: &ResolvedFilters, min_hits: usize) -> LedgerResult<Vec<i64>> {
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();
    let mut sql = String::from("SELECT m.id FROM memories m");

    if !filters.keywords.is_empty() {
        let placeholders = vec!["?"; filters.keywords.len()].join(", ");
        sql.push_str(&format!(
            " JOIN memory_tags mt ON mt.memory_id = m.id AND mt.tag IN ({})",
            placeholders
        ));
        for keyword in &filters.keywords {
            params.push(Box::new(keyword.clone()));
        }
    }

    let mut conditions = Vec::new();
    if let Some(category) = &filters.category {
        conditions.push("LOWER(m.category) = LOWER(?)");
        params.push(Box::new(category.clone()));
    }
    if let Some(topic_id) = &filters.topic_id {
        conditions.push("EXISTS (SELECT 1 FROM memory_topics t WHERE t.memory_id = m.id AND t.topic_id = ?)");
        params.push(Box::new(topic_id.clone()));
    }
    if let Some(after) = &filters.created_after {
        conditions.push("m.created_at >= ?");
        params.push(Box::new(after.clone()));
    }
    if let Some(before) = &filters.created_before {
        conditions.push("m.created_at <= ?");
        params.push(Box::new(before.clone()));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if filters.keywords.is_empty() {
        sql.push_str(" ORDER BY m.created_at DESC, m.id DESC LIMIT ?");
    } else {
        sql.push_str(" GROUP BY m.id HAVING COUNT(mt.tag) >= ? ORDER BY COUNT(mt.tag) DESC, m.created_at DESC, m.id DESC LIMIT ?");
        params.push(Box::new(min_hits as i64));
    }
    params.push(Box::new(filters.limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn load_entries(conn: &Connection, ids: &[i64]) -> LedgerResult<Vec<MemoryEntry>> {
    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(entry) = load_memory_with_conn(conn, *id)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::NewMemory;

    fn memory(text: &str, tags: &[&str], category: Option<&str>) -> NewMemory {
        NewMemory {
            text: text.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            category: category.map(str::to_string),
            topic_id: None,
        }
    }

    fn setup() -> (Arc<MemoryDatabase>, MemorySearch) {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        db.memories.create(&memory("both work", &["alpha", "beta"], Some("Work"))).unwrap();
        db.memories.create(&memory("alpha work", &["alpha"], Some("Work"))).unwrap();
        db.memories.create(&memory("both home", &["alpha", "beta"], Some("Home"))).unwrap();
        db.memories.create(&memory("gamma", &["gamma"], None)).unwrap();
        let search = MemorySearch::new(Arc::clone(&db));
        (db, search)
    }

    fn texts(outcome: &SearchOutcome) -> Vec<&str> {
        outcome.memories.iter().map(|m| m.text.as_str()).collect()
    }

    // ===== Intersection =====

    #[test]
    fn test_keywords_and_category_intersect() {
        let (_db, search) = setup();
        let outcome = search
            .search(&SearchFilters {
                keywords: vec!["alpha".into(), "beta".into()],
                min_keywords: Some(2),
                category: Some("work".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(texts(&outcome), vec!["both work"]);
        assert_eq!(outcome.min_keywords, Some(2));
    }

    #[test]
    fn test_more_shared_tags_rank_first() {
        let (_db, search) = setup();
        let outcome = search
            .search(&SearchFilters {
                keywords: vec!["Alpha".into(), "beta".into()],
                category: Some("Work".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(texts(&outcome), vec!["both work", "alpha work"]);
    }

    #[test]
    fn test_min_keywords_relaxes_to_one() {
        let (_db, search) = setup();
        let outcome = search
            .search(&SearchFilters {
                keywords: vec!["gamma".into(), "delta".into()],
                min_keywords: Some(2),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(texts(&outcome), vec!["gamma"]);
        assert_eq!(outcome.min_keywords, Some(1));
    }

    #[test]
    fn test_no_match_returns_empty() {
        let (_db, search) = setup();
        let outcome = search
            .search(&SearchFilters {
                keywords: vec!["nothing".into()],
                ..Default::default()
            })
            .unwrap();
        assert!(outcome.memories.is_empty());
    }

    #[test]
    fn test_memory_id_short_circuits() {
        let (_db, search) = setup();
        let outcome = search
            .search(&SearchFilters {
                memory_id: Some(4),
                keywords: vec!["alpha".into()],
                category: Some("Work".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(texts(&outcome), vec!["gamma"]);

        let missing = search
            .search(&SearchFilters {
                memory_id: Some(999),
                ..Default::default()
            })
            .unwrap();
        assert!(missing.memories.is_empty());
    }

    #[test]
    fn test_topic_filter() {
        let (db, search) = setup();
        {
            let conn = db.get_conn().unwrap();
            crate::memory_db::topic_store::create_topic_with_conn(&conn, "alice", "Deploys", 1, 1).unwrap();
        }
        let topic = db.topics.list_for_user("alice").unwrap().remove(0);
        db.memories.link_topic(2, &topic.id).unwrap();

        let outcome = search
            .search(&SearchFilters {
                topic_id: Some(topic.id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(texts(&outcome), vec!["alpha work"]);
    }

    #[test]
    fn test_time_range_is_inclusive() {
        let (db, search) = setup();
        {
            let conn = db.get_conn().unwrap();
            conn.execute(
                "UPDATE memories SET created_at = '2024-03-01T00:00:00.000000Z' WHERE id = 1",
                [],
            )
            .unwrap();
        }
        let outcome = search
            .search(&SearchFilters {
                created_after: Some("2024-03-01T00:00:00Z".into()),
                created_before: Some("2024-03-01".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(texts(&outcome), vec!["both work"]);
    }

    #[test]
    fn test_search_does_not_bump_access() {
        let (db, search) = setup();
        search
            .search(&SearchFilters {
                keywords: vec!["gamma".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(db.memories.load_many(&[4]).unwrap()[0].access_count, 0);
    }

    // ===== Validation =====

    #[test]
    fn test_invalid_filters_are_rejected() {
        let (_db, search) = setup();
        let cases = vec![
            SearchFilters {
                keywords: vec!["alpha".into()],
                min_keywords: Some(0),
                ..Default::default()
            },
            SearchFilters {
                created_after: Some("2024-05-01".into()),
                created_before: Some("2024-04-01".into()),
                ..Default::default()
            },
            SearchFilters {
                created_after: Some("yesterday".into()),
                ..Default::default()
            },
            SearchFilters {
                limit: Some(0),
                ..Default::default()
            },
        ];
        for filters in cases {
            assert!(matches!(search.search(&filters), Err(LedgerError::Validation(_))));
        }
    }

    #[test]
    fn test_limit_is_clamped() {
        let filters = SearchFilters {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(filters.resolve().unwrap().limit, MAX_SEARCH_LIMIT);
    }
}
