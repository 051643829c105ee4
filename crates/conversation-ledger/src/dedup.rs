//! Near-duplicate memory consolidation.
//!
//! Memories sharing at least `min_overlap` tags are linked; each connected
//! component small enough to review becomes a candidate group. The highest
//! priority groups go to the reasoning collaborator, whose merge plan is
//! applied one group per transaction.

use crate::collaborator::{self, CandidateGroup, CandidateMemory, MergePlan, ReasoningCollaborator};
use crate::config::DedupConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::memory_db::memory_store::{
    copy_topic_links_with_conn, delete_memory_with_conn, mark_reviewed_with_conn, update_memory_with_conn, TagPosting,
};
use crate::memory_db::MemoryDatabase;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A connected component of the candidate graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCandidate {
    pub priority: f64,
    /// Sorted ascending.
    pub member_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DedupReport {
    pub candidate_groups: usize,
    pub oversized_groups: usize,
    pub groups_selected: usize,
    pub calls_issued: usize,
    pub groups_merged: usize,
    pub groups_unchanged: usize,
    pub groups_failed: usize,
    pub memories_absorbed: usize,
    pub deferred_groups: usize,
    pub cancelled: bool,
}

fn shared_count(a: &BTreeSet<String>, b: &BTreeSet<String>) -> usize {
    a.intersection(b).count()
}

fn find(parent: &mut [usize], x: usize) -> usize {
    let mut root = x;
    while parent[root] != root {
        root = parent[root];
    }
    let mut current = x;
    while parent[current] != root {
        let next = parent[current];
        parent[current] = root;
        current = next;
    }
    root
}

/// Builds the candidate graph from the tag index and returns every component
/// within the size limit, highest priority first. The second value counts
/// components discarded for size.
pub fn build_groups(postings: &[TagPosting], config: &DedupConfig) -> (Vec<GroupCandidate>, usize) {
    let mut by_tag: BTreeMap<&str, Vec<(i64, bool)>> = BTreeMap::new();
    let mut tags_of: HashMap<i64, BTreeSet<String>> = HashMap::new();
    for posting in postings {
        by_tag
            .entry(posting.tag.as_str())
            .or_default()
            .push((posting.memory_id, posting.reviewed));
        tags_of.entry(posting.memory_id).or_default().insert(posting.tag.clone());
    }

    let skipped = by_tag.values().filter(|list| list.len() > config.max_tag_fanout).count();
    if skipped > 0 {
        debug!("Ignoring {} tags above the fan-out cap of {}", skipped, config.max_tag_fanout);
    }

    let pair_counts: HashMap<(i64, i64), usize> = by_tag
        .par_iter()
        .filter(|(_, list)| list.len() <= config.max_tag_fanout)
        .fold(HashMap::new, |mut counts, (_, list)| {
            for (i, (a, a_reviewed)) in list.iter().enumerate() {
                for (b, b_reviewed) in &list[i + 1..] {
                    if *a_reviewed && *b_reviewed {
                        continue;
                    }
                    let key = if a < b { (*a, *b) } else { (*b, *a) };
                    *counts.entry(key).or_insert(0) += 1;
                }
            }
            counts
        })
        .reduce(HashMap::new, |mut left, right| {
            for (key, count) in right {
                *left.entry(key).or_insert(0) += count;
            }
            left
        });

    let mut edges: Vec<(i64, i64)> = pair_counts
        .into_iter()
        .filter(|(_, count)| *count >= config.min_overlap)
        .map(|(pair, _)| pair)
        .collect();
    edges.sort_unstable();

    let nodes: Vec<i64> = edges
        .iter()
        .flat_map(|(a, b)| [*a, *b])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let index: HashMap<i64, usize> = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut parent: Vec<usize> = (0..nodes.len()).collect();
    for (a, b) in &edges {
        let ra = find(&mut parent, index[a]);
        let rb = find(&mut parent, index[b]);
        if ra != rb {
            parent[ra] = rb;
        }
    }

    let mut components: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
    for (i, id) in nodes.iter().enumerate() {
        let root = find(&mut parent, i);
        components.entry(root).or_default().push(*id);
    }

    let mut oversized = 0;
    let mut groups = Vec::new();
    for mut members in components.into_values() {
        if members.len() > config.max_group_size {
            oversized += 1;
            continue;
        }
        members.sort_unstable();

        let mut total = 0usize;
        let mut pairs = 0usize;
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                total += shared_count(&tags_of[a], &tags_of[b]);
                pairs += 1;
            }
        }
        let average = total as f64 / pairs.max(1) as f64;
        groups.push(GroupCandidate {
            priority: average / members.len() as f64,
            member_ids: members,
        });
    }

    groups.sort_by(|a, b| {
        b.priority
            .total_cmp(&a.priority)
            .then_with(|| a.member_ids[0].cmp(&b.member_ids[0]))
    });
    (groups, oversized)
}

pub struct DedupEngine {
    db: Arc<MemoryDatabase>,
    collaborator: Arc<dyn ReasoningCollaborator>,
    config: DedupConfig,
    call_timeout: Duration,
}

impl DedupEngine {
    pub fn new(
        db: Arc<MemoryDatabase>,
        collaborator: Arc<dyn ReasoningCollaborator>,
        config: DedupConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            collaborator,
            config,
            call_timeout,
        }
    }

    /// One consolidation run. Cancellation is honoured between groups.
    pub async fn run_dedup(&self, cancel: &AtomicBool) -> LedgerResult<DedupReport> {
        let postings = self.db.memories.tag_postings()?;
        let (groups, oversized) = build_groups(&postings, &self.config);

        let selected = groups.len().min(self.config.max_groups_to_process);
        let mut report = DedupReport {
            candidate_groups: groups.len(),
            oversized_groups: oversized,
            groups_selected: selected,
            deferred_groups: groups.len() - selected,
            ..DedupReport::default()
        };

        for (position, group) in groups.iter().take(selected).enumerate() {
            if cancel.load(Ordering::SeqCst) {
                info!("Dedup run cancelled with {} groups left", selected - position);
                report.cancelled = true;
                report.deferred_groups += selected - position;
                break;
            }

            report.calls_issued += 1;
            match self.process_group(group).await {
                Ok(0) => report.groups_unchanged += 1,
                Ok(absorbed) => {
                    report.groups_merged += 1;
                    report.memories_absorbed += absorbed;
                }
                Err(
                    e @ (LedgerError::CollaboratorUnavailable(_) | LedgerError::Validation(_) | LedgerError::NotFound(_)),
                ) => {
                    warn!("Skipping dedup group {:?}: {}", group.member_ids, e);
                    report.groups_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Dedup run: {} candidate groups, {} adjudicated, {} merged, {} memories absorbed, {} failed, {} deferred",
            report.candidate_groups,
            report.calls_issued,
            report.groups_merged,
            report.memories_absorbed,
            report.groups_failed,
            report.deferred_groups
        );
        Ok(report)
    }

    /// Adjudicates and applies one group, returning the number of absorbed memories.
    async fn process_group(&self, group: &GroupCandidate) -> LedgerResult<usize> {
        let entries = self.db.memories.load_many(&group.member_ids)?;
        if entries.len() != group.member_ids.len() {
            return Err(LedgerError::not_found("a group member was deleted before adjudication"));
        }

        let request = CandidateGroup {
            priority: group.priority,
            members: entries
                .into_iter()
                .map(|entry| CandidateMemory {
                    id: entry.id,
                    text: entry.text,
                    tags: entry.tags,
                    category: entry.category,
                })
                .collect(),
        };

        let reasoning = &self.collaborator;
        let payload = collaborator::call_once("adjudicate", self.call_timeout, reasoning.adjudicate(&request)).await?;
        let members: BTreeSet<i64> = group.member_ids.iter().copied().collect();
        let plan = MergePlan::from_payload(payload, &members)?;

        self.db.with_transaction(|tx| {
            let mut absorbed = BTreeSet::new();
            for decision in &plan.merges {
                update_memory_with_conn(tx, decision.keep_id, &decision.text, &decision.tags, decision.category.as_deref())?;
                for id in &decision.absorb_ids {
                    copy_topic_links_with_conn(tx, *id, decision.keep_id)?;
                    delete_memory_with_conn(tx, *id)?;
                    absorbed.insert(*id);
                }
            }
            let survivors: Vec<i64> = members.difference(&absorbed).copied().collect();
            mark_reviewed_with_conn(tx, &survivors)?;

            debug!(
                "Dedup group {:?}: {} merges, {} absorbed",
                group.member_ids,
                plan.merges.len(),
                absorbed.len()
            );
            Ok(absorbed.len())
        })
    }
}
