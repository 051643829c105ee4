use super::scorer::{self, HeatmapState, KeywordEvent, TickOutcome};
use crate::error::LedgerResult;
use crate::memory_db::heatmap_store::{replace_keywords_with_conn, replace_memory_scores_with_conn};
use crate::memory_db::memory_store::{tag_postings_with_conn, TagPosting};
use crate::memory_db::{MemoryDatabase, MemoryEntry};
use arc_swap::ArcSwap;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Last completed heatmap cycle as seen by readers.
#[derive(Debug, Clone, Default)]
pub struct HeatmapSnapshot {
    pub state: HeatmapState,
    pub memory_scores: HashMap<i64, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub score: f64,
    #[serde(flatten)]
    pub memory: MemoryEntry,
}

/// Owns the heatmap: ticks are serialised, reads go to an immutable snapshot.
pub struct HeatmapService {
    db: Arc<MemoryDatabase>,
    snapshot: ArcSwap<HeatmapSnapshot>,
    tick_lock: Mutex<()>,
}

impl HeatmapService {
    /// Restores the persisted keyword set and rebuilds the memory-score cache from it.
    pub fn load(db: Arc<MemoryDatabase>) -> LedgerResult<Self> {
        let state = HeatmapState::from_rows(db.heatmap.load_keywords()?);
        info!("Loaded heatmap with {} active keywords", state.len());
        let service = Self {
            db,
            snapshot: ArcSwap::from_pointee(HeatmapSnapshot::default()),
            tick_lock: Mutex::new(()),
        };
        let snapshot = service.persist(state, false)?;
        service.snapshot.store(Arc::new(snapshot));
        Ok(service)
    }

    pub fn snapshot(&self) -> Arc<HeatmapSnapshot> {
        self.snapshot.load_full()
    }

    /// Runs one scoring cycle over the keywords observed since the last one.
    pub async fn update_heatmap(&self, events: &[KeywordEvent]) -> LedgerResult<TickOutcome> {
        let _guard = self.tick_lock.lock().await;
        let current = self.snapshot.load_full();
        let (next, outcome) = scorer::tick(&current.state, events, Utc::now())?;

        let snapshot = self.persist(next, true)?;
        self.snapshot.store(Arc::new(snapshot));

        debug!(
            "Heatmap cycle {}: {} inserted, {} reinforced, {} removed, {} active",
            outcome.cycle,
            outcome.inserted.len(),
            outcome.reinforced.len(),
            outcome.removed.len(),
            outcome.active_keywords
        );
        Ok(outcome)
    }

    /// Recomputes cached memory scores against the current keyword set after memories changed.
    pub async fn refresh_memory_scores(&self) -> LedgerResult<()> {
        let _guard = self.tick_lock.lock().await;
        let current = self.snapshot.load_full();
        let snapshot = self.persist(current.state.clone(), false)?;
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    pub fn memory_relevance<S: AsRef<str>>(&self, tags: &[S]) -> f64 {
        scorer::memory_relevance(&self.snapshot.load().state, tags)
    }

    /// The `n` memories with the highest cached scores, ties broken by memory id.
    pub fn top_memories(&self, n: usize) -> LedgerResult<Vec<ScoredMemory>> {
        let ranked = self.db.heatmap.top_memory_scores(n)?;
        let ids: Vec<i64> = ranked.iter().map(|(id, _)| *id).collect();
        let entries = self.db.memories.load_many(&ids)?;
        let scores: HashMap<i64, f64> = ranked.into_iter().collect();
        Ok(entries
            .into_iter()
            .map(|memory| ScoredMemory {
                score: scores.get(&memory.id).copied().unwrap_or(0.0),
                memory,
            })
            .collect())
    }

    /// Writes keyword rows (when `write_keywords`) and the memory-score cache in
    /// one transaction, returning the snapshot to publish.
    fn persist(&self, state: HeatmapState, write_keywords: bool) -> LedgerResult<HeatmapSnapshot> {
        let now = Utc::now();
        let memory_scores = self.db.with_transaction(|tx| {
            if write_keywords {
                replace_keywords_with_conn(tx, &state.to_rows())?;
            }
            let scores = compute_memory_scores(&state, &tag_postings_with_conn(tx)?);
            replace_memory_scores_with_conn(tx, &scores, &now)?;
            Ok(scores)
        })?;

        Ok(HeatmapSnapshot {
            state,
            memory_scores: memory_scores.into_iter().filter(|(_, score)| *score > 0.0).collect(),
        })
    }
}

fn compute_memory_scores(state: &HeatmapState, postings: &[TagPosting]) -> Vec<(i64, f64)> {
    let mut tags_by_memory: BTreeMap<i64, Vec<&str>> = BTreeMap::new();
    for posting in postings {
        tags_by_memory
            .entry(posting.memory_id)
            .or_default()
            .push(posting.tag.as_str());
    }
    tags_by_memory
        .into_iter()
        .map(|(id, tags)| (id, scorer::memory_relevance(state, &tags)))
        .collect()
}
