//! Shared ledger state.
//!
//! `SharedState` wires the stores and engines together and is the query
//! surface used by the HTTP layer and the CLI. Mutations that change tags or
//! memories refresh the cached heatmap memory scores afterwards.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    collaborator::{self, ReasoningCollaborator},
    config::Config,
    dedup::{DedupEngine, DedupReport},
    error::{LedgerError, LedgerResult},
    heatmap::{HeatmapService, KeywordEvent, ScoredMemory, TickOutcome},
    memory_db::{CanonicalMessage, DatabaseStats, MemoryDatabase, MemoryEntry, NewMemory, RawMessage, Topic},
    search::{MemorySearch, SearchFilters, SearchOutcome},
    sync_engine::{validate_user_id, SyncEngine, SyncOutcome},
    topics::{AssignOutcome, ScanReport, TopicEngine},
};

/// Process-wide activity counters reported by `/stats`.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub syncs: AtomicUsize,
    pub appended_messages: AtomicUsize,
    pub edited_messages: AtomicUsize,
    pub sync_conflicts: AtomicUsize,
    pub collaborator_failures: AtomicUsize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CounterSnapshot {
    pub syncs: usize,
    pub appended_messages: usize,
    pub edited_messages: usize,
    pub sync_conflicts: usize,
    pub collaborator_failures: usize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_sync(&self, outcome: &SyncOutcome) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        self.appended_messages.fetch_add(outcome.appended, Ordering::Relaxed);
        self.edited_messages.fetch_add(outcome.edited, Ordering::Relaxed);
        if outcome.conflict {
            self.sync_conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn add_collaborator_failures(&self, count: usize) -> usize {
        self.collaborator_failures.fetch_add(count, Ordering::Relaxed) + count
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            syncs: self.syncs.load(Ordering::Relaxed),
            appended_messages: self.appended_messages.load(Ordering::Relaxed),
            edited_messages: self.edited_messages.load(Ordering::Relaxed),
            sync_conflicts: self.sync_conflicts.load(Ordering::Relaxed),
            collaborator_failures: self.collaborator_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStats {
    pub database: DatabaseStats,
    pub counters: CounterSnapshot,
    pub heatmap_cycle: u64,
}

#[cfg(feature = "cli")]
fn export_sync_conflict() {
    crate::metrics::inc_sync_conflict();
}

#[cfg(not(feature = "cli"))]
fn export_sync_conflict() {}

pub struct SharedState {
    pub db: Arc<MemoryDatabase>,
    pub config: Arc<Config>,
    pub counters: Arc<AtomicCounters>,
    sync_engine: SyncEngine,
    heatmap: HeatmapService,
    topics: TopicEngine,
    dedup: DedupEngine,
    search: MemorySearch,
}

impl SharedState {
    /// Builds the state with the collaborator named by the configuration.
    pub fn new(config: Config, db: Arc<MemoryDatabase>) -> LedgerResult<Self> {
        let collaborator = collaborator::from_config(&config)?;
        Self::with_collaborator(config, db, collaborator)
    }

    pub fn with_collaborator(
        config: Config,
        db: Arc<MemoryDatabase>,
        collaborator: Arc<dyn ReasoningCollaborator>,
    ) -> LedgerResult<Self> {
        info!("Initializing shared ledger state");
        let timeout = config.collaborator_timeout();

        Ok(Self {
            sync_engine: SyncEngine::new(Arc::clone(&db), config.sync.clone()),
            heatmap: HeatmapService::load(Arc::clone(&db))?,
            topics: TopicEngine::new(Arc::clone(&db), Arc::clone(&collaborator), config.topics.clone(), timeout),
            dedup: DedupEngine::new(Arc::clone(&db), collaborator, config.dedup.clone(), timeout),
            search: MemorySearch::new(Arc::clone(&db)),
            counters: Arc::new(AtomicCounters::new()),
            config: Arc::new(config),
            db,
        })
    }

    // ===== Buffer =====

    pub async fn sync(&self, user_id: &str, batch: &[RawMessage]) -> LedgerResult<SyncOutcome> {
        let outcome = self.sync_engine.sync(user_id, batch).await?;
        self.counters.record_sync(&outcome);
        if outcome.conflict {
            export_sync_conflict();
        }
        Ok(outcome)
    }

    pub fn buffer(&self, user_id: &str, limit: Option<usize>, offset: Option<usize>) -> LedgerResult<Vec<CanonicalMessage>> {
        validate_user_id(user_id)?;
        self.db.messages.get_buffer(user_id, limit, offset)
    }

    pub fn purge_messages(&self, user_id: &str, from: &DateTime<Utc>, to: &DateTime<Utc>) -> LedgerResult<usize> {
        validate_user_id(user_id)?;
        if from > to {
            return Err(LedgerError::validation("purge range start is after its end"));
        }
        self.db.messages.purge_range(user_id, from, to)
    }

    // ===== Topics =====

    pub async fn scan_topics(&self, user_id: &str, cancel: &AtomicBool) -> LedgerResult<ScanReport> {
        let report = self.topics.scan_topics(user_id, cancel).await?;
        if report.failed_spans > 0 {
            let total = self.counters.add_collaborator_failures(report.failed_spans);
            warn!("{} spans failed classification ({} collaborator failures so far)", report.failed_spans, total);
        }
        if report.memories_created > 0 {
            self.heatmap.refresh_memory_scores().await?;
        }
        Ok(report)
    }

    pub fn topics_for_user(&self, user_id: &str) -> LedgerResult<Vec<Topic>> {
        validate_user_id(user_id)?;
        self.db.topics.list_for_user(user_id)
    }

    pub fn get_topic(&self, topic_id: &str) -> LedgerResult<Topic> {
        self.db.topics.get(topic_id)
    }

    pub fn assign_topic(&self, topic_id: &str, start: i64, end: i64) -> LedgerResult<AssignOutcome> {
        self.topics.assign_topic(topic_id, start, end)
    }

    pub fn delete_topic(&self, topic_id: &str) -> LedgerResult<()> {
        self.topics.delete_topic(topic_id)
    }

    // ===== Memories =====

    pub async fn create_memory(&self, memory: &NewMemory) -> LedgerResult<MemoryEntry> {
        let id = self.db.memories.create(memory)?;
        self.heatmap.refresh_memory_scores().await?;
        self.load_memory(id)
    }

    pub fn get_memory(&self, id: i64) -> LedgerResult<MemoryEntry> {
        self.db.memories.get(id)
    }

    pub async fn update_memory(&self, id: i64, memory: &NewMemory) -> LedgerResult<MemoryEntry> {
        let entry = self.db.memories.update(id, memory)?;
        self.heatmap.refresh_memory_scores().await?;
        Ok(entry)
    }

    pub async fn delete_memory(&self, id: i64) -> LedgerResult<()> {
        self.db.memories.delete(id)?;
        self.heatmap.refresh_memory_scores().await
    }

    pub fn link_memory_topic(&self, id: i64, topic_id: &str) -> LedgerResult<MemoryEntry> {
        self.db.memories.link_topic(id, topic_id)?;
        self.load_memory(id)
    }

    pub fn unlink_memory_topic(&self, id: i64, topic_id: &str) -> LedgerResult<MemoryEntry> {
        if !self.db.memories.unlink_topic(id, topic_id)? {
            return Err(LedgerError::not_found(format!("memory {} is not linked to topic {}", id, topic_id)));
        }
        self.load_memory(id)
    }

    fn load_memory(&self, id: i64) -> LedgerResult<MemoryEntry> {
        self.db
            .memories
            .load_many(&[id])?
            .pop()
            .ok_or_else(|| LedgerError::not_found(format!("memory {}", id)))
    }

    pub fn search(&self, filters: &SearchFilters) -> LedgerResult<SearchOutcome> {
        self.search.search(filters)
    }

    // ===== Heatmap =====

    pub async fn update_heatmap(&self, events: &[KeywordEvent]) -> LedgerResult<TickOutcome> {
        self.heatmap.update_heatmap(events).await
    }

    pub fn top_memories(&self, n: usize) -> LedgerResult<Vec<ScoredMemory>> {
        self.heatmap.top_memories(n)
    }

    pub fn memory_relevance(&self, tags: &[String]) -> f64 {
        self.heatmap.memory_relevance(tags)
    }

    // ===== Maintenance =====

    pub async fn run_dedup(&self, cancel: &AtomicBool) -> LedgerResult<DedupReport> {
        let report = self.dedup.run_dedup(cancel).await?;
        if report.groups_failed > 0 {
            self.counters.add_collaborator_failures(report.groups_failed);
        }
        if report.groups_merged > 0 {
            self.heatmap.refresh_memory_scores().await?;
        }
        Ok(report)
    }

    pub fn run_maintenance(&self) -> LedgerResult<()> {
        self.db.run_maintenance()
    }

    pub fn stats(&self) -> LedgerResult<LedgerStats> {
        Ok(LedgerStats {
            database: self.db.get_stats()?,
            counters: self.counters.snapshot(),
            heatmap_cycle: self.heatmap.snapshot().state.cycle,
        })
    }
}
