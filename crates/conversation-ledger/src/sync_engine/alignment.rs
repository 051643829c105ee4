//! Batch-to-buffer alignment.
//!
//! A walk pairs batch position `i + t` with window position `w + t`. It starts
//! at a strict match and continues while pairs strictly match or are an
//! in-place assistant edit. A walk is usable only when it runs off the end of
//! the window or of the batch, and every batch message before its start is
//! already known history.

use super::normalize::IncomingMessage;
use crate::memory_db::{CanonicalMessage, Role};
use chrono::Duration;

#[derive(Debug, Clone, Copy)]
pub struct MatchRules {
    pub timestamp_tolerance: Duration,
}

impl MatchRules {
    pub fn new(timestamp_tolerance_seconds: i64) -> Self {
        Self {
            timestamp_tolerance: Duration::seconds(timestamp_tolerance_seconds),
        }
    }

    /// Same role, and either equal platform ids or (when an id is missing)
    /// equal fingerprints, agreeing tool_call_id and timestamps within tolerance.
    pub fn strict_match(&self, incoming: &IncomingMessage, stored: &CanonicalMessage) -> bool {
        if incoming.role != stored.role {
            return false;
        }
        if let (Some(a), Some(b)) = (incoming.platform_msg_id.as_deref(), stored.platform_msg_id.as_deref()) {
            return a == b;
        }
        if incoming.content_hash != stored.content_hash || incoming.tool_call_id != stored.tool_call_id {
            return false;
        }
        match (incoming.sent_at, stored.sent_at) {
            (Some(a), Some(b)) => (a - b).abs() <= self.timestamp_tolerance,
            _ => true,
        }
    }

    /// An assistant message standing where a stored assistant row stands,
    /// whose ids do not contradict each other.
    pub fn assistant_edit(&self, incoming: &IncomingMessage, stored: &CanonicalMessage) -> bool {
        if incoming.role != Role::Assistant || stored.role != Role::Assistant {
            return false;
        }
        match (incoming.platform_msg_id.as_deref(), stored.platform_msg_id.as_deref()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// Position of the most recent window row `incoming` strictly matches,
    /// preferring active rows over superseded ones.
    pub fn find_in_window(&self, incoming: &IncomingMessage, window: &[CanonicalMessage]) -> Option<usize> {
        let mut superseded_hit = None;
        for (pos, row) in window.iter().enumerate().rev() {
            if self.strict_match(incoming, row) {
                if !row.superseded {
                    return Some(pos);
                }
                superseded_hit.get_or_insert(pos);
            }
        }
        superseded_hit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKind {
    Kept,
    Edited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Walk {
    pub batch_start: usize,
    pub window_start: usize,
    pub pairs: Vec<PairKind>,
    pub reaches_window_end: bool,
    pub reaches_batch_end: bool,
}

impl Walk {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// First batch position after the walk.
    pub fn batch_end(&self) -> usize {
        self.batch_start + self.pairs.len()
    }
}

fn walk_from(
    rules: &MatchRules,
    batch: &[IncomingMessage],
    window: &[CanonicalMessage],
    i: usize,
    w: usize,
) -> Walk {
    let mut pairs = vec![PairKind::Kept];
    let mut t = 1;
    while i + t < batch.len() && w + t < window.len() {
        let (incoming, stored) = (&batch[i + t], &window[w + t]);
        if rules.strict_match(incoming, stored) {
            pairs.push(PairKind::Kept);
        } else if rules.assistant_edit(incoming, stored) {
            pairs.push(PairKind::Edited);
        } else {
            break;
        }
        t += 1;
    }
    Walk {
        batch_start: i,
        window_start: w,
        reaches_window_end: w + t == window.len(),
        reaches_batch_end: i + t == batch.len(),
        pairs,
    }
}

/// Best usable walk: most pairs, then one reaching the window end, then the
/// earliest batch start, then the latest window start.
///
/// `known[b]` tells whether batch message `b` may precede the walk.
pub fn best_walk(
    rules: &MatchRules,
    batch: &[IncomingMessage],
    window: &[CanonicalMessage],
    known: &[bool],
) -> Option<Walk> {
    let mut best: Option<Walk> = None;
    // Number of leading batch messages that are all known.
    let known_prefix = known.iter().take_while(|k| **k).count();

    for i in 0..batch.len().min(known_prefix + 1) {
        for w in 0..window.len() {
            if !rules.strict_match(&batch[i], &window[w]) {
                continue;
            }
            let walk = walk_from(rules, batch, window, i, w);
            if !(walk.reaches_window_end || walk.reaches_batch_end) {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    (walk.len(), walk.reaches_window_end) > (current.len(), current.reaches_window_end)
                        || ((walk.len(), walk.reaches_window_end) == (current.len(), current.reaches_window_end)
                            && walk.batch_start == current.batch_start
                            && walk.window_start > current.window_start)
                }
            };
            if better {
                best = Some(walk);
            }
        }
    }
    best
}
