//! Sync engine - reconciles raw platform batches against the stored buffer.
//!
//! One sync holds the user's lock and runs in a single immediate transaction:
//! the batch is aligned against the buffer tail, matched pairs are kept or
//! edited in place, and whatever follows the alignment is appended under the
//! boundary rules (identical user turns collapse, an unanswered user turn is
//! superseded by the next one, nothing but a user turn may open the buffer).

pub mod alignment;
pub mod normalize;

pub use alignment::{MatchRules, PairKind, Walk};
pub use normalize::{normalize_batch, validate_user_id, IncomingMessage, MAX_BATCH_MESSAGES, MAX_CONTENT_BYTES};

use crate::config::SyncConfig;
use crate::error::LedgerResult;
use crate::memory_db::message_store::{
    active_tail_with_conn, get_message_with_conn, history_candidates_with_conn, insert_message_with_conn,
    set_platform_msg_id_with_conn, strip_leading_non_user_with_conn, supersede_with_conn, tail_window_with_conn,
    update_assistant_content_with_conn,
};
use crate::memory_db::{CanonicalMessage, MemoryDatabase, RawMessage, Role};
use crate::utils::{TextUtils, UserLocks};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SyncOutcome {
    /// Active rows the batch resolved to, in sequence order.
    pub messages: Vec<CanonicalMessage>,
    pub kept: usize,
    pub edited: usize,
    pub appended: usize,
    pub collapsed: usize,
    pub superseded: usize,
    pub dropped: usize,
    pub conflict: bool,
}

pub struct SyncEngine {
    db: Arc<MemoryDatabase>,
    config: SyncConfig,
    user_locks: UserLocks,
}

impl SyncEngine {
    pub fn new(db: Arc<MemoryDatabase>, config: SyncConfig) -> Self {
        Self {
            db,
            config,
            user_locks: UserLocks::new(),
        }
    }

    pub async fn sync(&self, user_id: &str, batch: &[RawMessage]) -> LedgerResult<SyncOutcome> {
        validate_user_id(user_id)?;
        let incoming = normalize_batch(batch)?;
        if incoming.is_empty() {
            return Ok(SyncOutcome::default());
        }

        let _guard = self.user_locks.lock(user_id).await;

        let outcome = self
            .db
            .with_transaction(|tx| Reconciler::new(tx, user_id, &self.config).run(&incoming))?;

        if outcome.conflict {
            let preview = incoming
                .first()
                .map(|m| TextUtils::truncate_with_ellipsis(&m.content, 40).into_owned())
                .unwrap_or_default();
            warn!(
                "Sync conflict for user {}: batch of {} (starting '{}') did not align, appended {}",
                user_id,
                incoming.len(),
                preview,
                outcome.appended
            );
        }
        info!(
            "Synced {} messages for user {}: kept {}, edited {}, appended {}, collapsed {}, superseded {}",
            incoming.len(),
            user_id,
            outcome.kept,
            outcome.edited,
            outcome.appended,
            outcome.collapsed,
            outcome.superseded
        );
        Ok(outcome)
    }
}

/// State of one sync inside its transaction.
struct Reconciler<'a> {
    conn: &'a Connection,
    user_id: &'a str,
    config: &'a SyncConfig,
    rules: MatchRules,
    resolved: Vec<i64>,
    outcome: SyncOutcome,
}

impl<'a> Reconciler<'a> {
    fn new(conn: &'a Connection, user_id: &'a str, config: &'a SyncConfig) -> Self {
        Self {
            conn,
            user_id,
            config,
            rules: MatchRules::new(config.timestamp_tolerance_seconds),
            resolved: Vec::new(),
            outcome: SyncOutcome::default(),
        }
    }

    fn run(mut self, batch: &[IncomingMessage]) -> LedgerResult<SyncOutcome> {
        let window = tail_window_with_conn(self.conn, self.user_id, self.config.window)?;
        let history = self.known_rows(batch, &window)?;

        let first_user = batch.iter().position(|m| m.role == Role::User).unwrap_or(batch.len());
        let known: Vec<bool> = batch
            .iter()
            .enumerate()
            .map(|(b, m)| history[b].is_some() || (b < first_user && m.role != Role::User))
            .collect();

        match alignment::best_walk(&self.rules, batch, &window, &known) {
            Some(walk) => {
                debug!(
                    "Aligned batch[{}..{}] with window[{}..] for user {}",
                    walk.batch_start,
                    walk.batch_end(),
                    walk.window_start,
                    self.user_id
                );
                // Everything before the walk is known history or stripped preamble.
                for row in history.iter().take(walk.batch_start) {
                    match row {
                        Some(id) => {
                            self.resolved.push(*id);
                            self.outcome.kept += 1;
                        }
                        None => self.outcome.dropped += 1,
                    }
                }
                for (t, kind) in walk.pairs.iter().enumerate() {
                    self.apply_pair(&batch[walk.batch_start + t], &window[walk.window_start + t], *kind)?;
                }
                self.append_all(&batch[walk.batch_end()..])?;
            }
            None if window.is_empty() || history.iter().all(Option::is_none) => {
                self.append_all(batch)?;
            }
            None if history.iter().all(Option::is_some) => {
                self.resolved.extend(history.iter().flatten());
                self.outcome.kept += batch.len();
            }
            None => {
                self.outcome.conflict = true;
                self.append_all(batch)?;
            }
        }

        self.outcome.superseded += strip_leading_non_user_with_conn(self.conn, self.user_id)?;
        self.finish()
    }

    /// Row id each batch message already corresponds to, searching the window
    /// first and older history only where the answer can matter.
    fn known_rows(&self, batch: &[IncomingMessage], window: &[CanonicalMessage]) -> LedgerResult<Vec<Option<i64>>> {
        let mut known: Vec<Option<i64>> = batch
            .iter()
            .map(|m| self.rules.find_in_window(m, window).map(|pos| window[pos].id))
            .collect();

        let floor = match window.first() {
            Some(first) if window.len() >= self.config.window => first.sequence,
            _ => return Ok(known),
        };
        // Without any window anchor every message is consulted, so that a
        // re-sent stretch of old history is recognised as a whole.
        let limit = known.iter().rposition(Option::is_some).unwrap_or(batch.len());

        for (b, message) in batch.iter().enumerate().take(limit) {
            if known[b].is_some() {
                continue;
            }
            let candidates = history_candidates_with_conn(
                self.conn,
                self.user_id,
                floor,
                message.platform_msg_id.as_deref(),
                &message.content_hash,
            )?;
            known[b] = candidates
                .iter()
                .find(|row| self.rules.strict_match(message, row))
                .map(|row| row.id);
            if known[b].is_none() && limit == batch.len() {
                break;
            }
        }
        Ok(known)
    }

    fn apply_pair(&mut self, incoming: &IncomingMessage, stored: &CanonicalMessage, kind: PairKind) -> LedgerResult<()> {
        self.backfill_platform_id(incoming, stored)?;

        let metadata_changed = (incoming.tool_calls.is_some() && incoming.tool_calls != stored.tool_calls)
            || (incoming.function_call.is_some() && incoming.function_call != stored.function_call);
        let edit = match kind {
            PairKind::Edited => true,
            PairKind::Kept => incoming.role == Role::Assistant && (metadata_changed || incoming.content != stored.content),
        };

        if edit {
            update_assistant_content_with_conn(
                self.conn,
                stored.id,
                &incoming.content,
                incoming.tool_calls.as_ref(),
                incoming.function_call.as_ref(),
            )?;
            self.outcome.edited += 1;
            debug!("Edited assistant message {} in place", stored.id);
        } else {
            self.outcome.kept += 1;
        }
        self.resolved.push(stored.id);
        Ok(())
    }

    fn backfill_platform_id(&self, incoming: &IncomingMessage, stored: &CanonicalMessage) -> LedgerResult<()> {
        if let (Some(id), None) = (incoming.platform_msg_id.as_deref(), stored.platform_msg_id.as_deref()) {
            set_platform_msg_id_with_conn(self.conn, stored.id, id)?;
        }
        Ok(())
    }

    fn append_all(&mut self, messages: &[IncomingMessage]) -> LedgerResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut tail = active_tail_with_conn(self.conn, self.user_id)?;

        for message in messages {
            match tail.as_mut() {
                None if message.role != Role::User => {
                    debug!("Dropping leading {} message for user {}", message.role, self.user_id);
                    self.outcome.dropped += 1;
                    continue;
                }
                Some(last) if last.role == Role::User && message.role == Role::User => {
                    if last.content == message.content {
                        self.backfill_platform_id(message, last)?;
                        if last.platform_msg_id.is_none() {
                            last.platform_msg_id = message.platform_msg_id.clone();
                        }
                        self.resolved.push(last.id);
                        self.outcome.collapsed += 1;
                        continue;
                    }
                    supersede_with_conn(self.conn, last.id)?;
                    self.outcome.superseded += 1;
                    debug!("Superseded unanswered user message {}", last.id);
                }
                _ => {}
            }

            let row = insert_message_with_conn(self.conn, message.as_new(self.user_id))?;
            self.resolved.push(row.id);
            self.outcome.appended += 1;
            tail = Some(row);
        }
        Ok(())
    }

    fn finish(mut self) -> LedgerResult<SyncOutcome> {
        let mut rows: BTreeMap<i64, CanonicalMessage> = BTreeMap::new();
        let mut seen = HashSet::new();
        for id in &self.resolved {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(row) = get_message_with_conn(self.conn, *id)? {
                if !row.superseded {
                    rows.insert(row.sequence, row);
                }
            }
        }
        self.outcome.messages = rows.into_values().collect();
        Ok(self.outcome)
    }
}
