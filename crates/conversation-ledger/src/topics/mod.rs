//! Topic assignment - threads untagged buffer messages into topics and
//! extracts memories from each classified span.

pub mod similarity;

pub use similarity::{LexicalSimilarity, TopicSimilarity};

use crate::collaborator::{self, Classification, MessageSpan, ReasoningCollaborator, SpanMessage};
use crate::config::TopicConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::memory_db::memory_store::insert_memory_with_conn;
use crate::memory_db::message_store::{
    active_buffer_with_conn, range_summary_with_conn, set_topic_for_range_with_conn, untagged_in_range_with_conn,
};
use crate::memory_db::topic_store::{
    create_topic_with_conn, extend_topic_with_conn, get_topic_with_conn, preceding_topic_with_conn,
};
use crate::memory_db::{CanonicalMessage, MemoryDatabase, NewMemory, Topic};
use crate::sync_engine::validate_user_id;
use crate::utils::UserLocks;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScanReport {
    pub spans_classified: usize,
    pub topics_created: usize,
    pub topics_extended: usize,
    pub memories_created: usize,
    pub failed_spans: usize,
    pub deferred_spans: usize,
    /// Spans another writer tagged or rewrote while this scan was classifying them.
    pub stale_spans: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AssignOutcome {
    pub topic: Topic,
    pub messages_tagged: usize,
}

pub struct TopicEngine {
    db: Arc<MemoryDatabase>,
    collaborator: Arc<dyn ReasoningCollaborator>,
    similarity: Box<dyn TopicSimilarity>,
    config: TopicConfig,
    call_timeout: Duration,
    scan_locks: UserLocks,
}

impl TopicEngine {
    pub fn new(
        db: Arc<MemoryDatabase>,
        collaborator: Arc<dyn ReasoningCollaborator>,
        config: TopicConfig,
        call_timeout: Duration,
    ) -> Self {
        Self::with_similarity(db, collaborator, Box::new(LexicalSimilarity), config, call_timeout)
    }

    pub fn with_similarity(
        db: Arc<MemoryDatabase>,
        collaborator: Arc<dyn ReasoningCollaborator>,
        similarity: Box<dyn TopicSimilarity>,
        config: TopicConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            collaborator,
            similarity,
            config,
            call_timeout,
            scan_locks: UserLocks::new(),
        }
    }

    /// Splits the untagged part of the buffer into spans, classifies each and
    /// applies the result. A span that cannot be classified defers the rest of
    /// its run so topic ranges stay contiguous. Scans of one user are
    /// serialised; storage failures abort the scan.
    pub async fn scan_topics(&self, user_id: &str, cancel: &AtomicBool) -> LedgerResult<ScanReport> {
        validate_user_id(user_id)?;
        let _guard = self.scan_locks.lock(user_id).await;
        let buffer = {
            let conn = self.db.get_conn()?;
            active_buffer_with_conn(&conn, user_id)?
        };
        let runs = untagged_runs(&buffer);
        let mut report = ScanReport::default();

        'runs: for run in runs {
            let spans = self.spans_of(run);
            for (index, span) in spans.iter().enumerate() {
                if cancel.load(Ordering::SeqCst) {
                    info!("Topic scan for user {} cancelled", user_id);
                    report.cancelled = true;
                    break 'runs;
                }
                if span.len() < self.config.min_span_messages {
                    report.deferred_spans += spans.len() - index;
                    break;
                }

                match self.classify_and_apply(user_id, span, &mut report).await {
                    Ok(true) => report.spans_classified += 1,
                    Ok(false) => {
                        debug!(
                            "Span {}..={} for user {} changed during classification",
                            span[0].sequence,
                            span[span.len() - 1].sequence,
                            user_id
                        );
                        report.stale_spans += 1;
                    }
                    Err(e @ (LedgerError::CollaboratorUnavailable(_) | LedgerError::Validation(_))) => {
                        warn!(
                            "Skipping span {}..={} for user {}: {}",
                            span[0].sequence,
                            span[span.len() - 1].sequence,
                            user_id,
                            e
                        );
                        report.failed_spans += 1;
                        report.deferred_spans += spans.len() - index - 1;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            "Topic scan for user {}: {} spans, {} created, {} extended, {} memories, {} failed, {} deferred, {} stale",
            user_id,
            report.spans_classified,
            report.topics_created,
            report.topics_extended,
            report.memories_created,
            report.failed_spans,
            report.deferred_spans,
            report.stale_spans
        );
        Ok(report)
    }

    fn spans_of<'m>(&self, run: &'m [CanonicalMessage]) -> Vec<&'m [CanonicalMessage]> {
        run.chunks(self.config.max_span_messages.max(1)).collect()
    }

    async fn classify_and_apply(
        &self,
        user_id: &str,
        span: &[CanonicalMessage],
        report: &mut ScanReport,
    ) -> LedgerResult<bool> {
        let start = span[0].sequence;
        let end = span[span.len() - 1].sequence;

        let preceding_topic = {
            let conn = self.db.get_conn()?;
            preceding_topic_with_conn(&conn, user_id, start)?.map(|t| t.name)
        };
        let request = MessageSpan {
            user_id: user_id.to_string(),
            start,
            end,
            preceding_topic,
            messages: span
                .iter()
                .map(|m| SpanMessage {
                    sequence: m.sequence,
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect(),
        };

        let reasoning = &self.collaborator;
        let request = &request;
        let payload =
            collaborator::call_with_retry("classify", self.call_timeout, move || reasoning.classify(request)).await?;
        let classification = Classification::from_payload(payload)?;

        let threshold = self.config.similarity_threshold;
        let applied = self.db.with_transaction(|tx| {
            if untagged_in_range_with_conn(tx, user_id, start, end)? != span.len() {
                return Ok(None);
            }
            let (topic, extended) = match preceding_topic_with_conn(tx, user_id, start)? {
                Some(previous) if self.similarity.is_similar(&previous.name, &classification.topic_name, threshold) => {
                    extend_topic_with_conn(tx, &previous.id, start, end)?;
                    (previous, true)
                }
                _ => (
                    create_topic_with_conn(tx, user_id, &classification.topic_name, start, end)?,
                    false,
                ),
            };
            set_topic_for_range_with_conn(tx, user_id, &topic.id, start, end)?;

            for extracted in &classification.memories {
                insert_memory_with_conn(
                    tx,
                    &NewMemory {
                        text: extracted.text.clone(),
                        tags: extracted.tags.clone(),
                        category: extracted.category.clone(),
                        topic_id: Some(topic.id.clone()),
                    },
                )?;
            }
            debug!(
                "{} topic '{}' over {}..={}",
                if extended { "Extended" } else { "Created" },
                topic.name,
                start,
                end
            );
            Ok(Some((extended, classification.memories.len())))
        })?;

        let Some((extended, memories)) = applied else {
            return Ok(false);
        };
        if extended {
            report.topics_extended += 1;
        } else {
            report.topics_created += 1;
        }
        report.memories_created += memories;
        Ok(true)
    }

    /// Tags the buffer messages in `start..=end` with the topic and widens its range.
    pub fn assign_topic(&self, topic_id: &str, start: i64, end: i64) -> LedgerResult<AssignOutcome> {
        if start > end {
            return Err(LedgerError::validation(format!("range start {} is after end {}", start, end)));
        }

        self.db.with_transaction(|tx| {
            let topic = get_topic_with_conn(tx, topic_id)?
                .ok_or_else(|| LedgerError::not_found(format!("topic {}", topic_id)))?;

            let (active, foreign) = range_summary_with_conn(tx, &topic.user_id, start, end, &topic.id)?;
            if active == 0 {
                return Err(LedgerError::validation(format!(
                    "no buffer messages in {}..={} for user {}",
                    start, end, topic.user_id
                )));
            }
            if foreign > 0 {
                return Err(LedgerError::validation(format!(
                    "{}..={} contains {} messages of another topic",
                    start, end, foreign
                )));
            }

            let gap = if end < topic.range_start {
                Some((end + 1, topic.range_start - 1))
            } else if start > topic.range_end {
                Some((topic.range_end + 1, start - 1))
            } else {
                None
            };
            if let Some((lo, hi)) = gap.filter(|(lo, hi)| lo <= hi) {
                let (between, _) = range_summary_with_conn(tx, &topic.user_id, lo, hi, &topic.id)?;
                if between > 0 {
                    return Err(LedgerError::validation(format!(
                        "{}..={} is not contiguous with topic range {}..={}",
                        start, end, topic.range_start, topic.range_end
                    )));
                }
            }

            extend_topic_with_conn(tx, &topic.id, start, end)?;
            let messages_tagged = set_topic_for_range_with_conn(tx, &topic.user_id, &topic.id, start, end)?;
            let topic = get_topic_with_conn(tx, &topic.id)?
                .ok_or_else(|| LedgerError::not_found(format!("topic {}", topic_id)))?;

            info!("Assigned {} messages to topic {}", messages_tagged, topic.id);
            Ok(AssignOutcome { topic, messages_tagged })
        })
    }

    pub fn delete_topic(&self, topic_id: &str) -> LedgerResult<()> {
        self.db.topics.delete(topic_id)
    }
}

/// Maximal stretches of adjacent buffer messages without a topic.
fn untagged_runs(buffer: &[CanonicalMessage]) -> Vec<&[CanonicalMessage]> {
    let mut runs = Vec::new();
    let mut start = None;
    for (index, message) in buffer.iter().enumerate() {
        match (message.topic_id.is_none(), start) {
            (true, None) => start = Some(index),
            (false, Some(s)) => {
                runs.push(&buffer[s..index]);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(&buffer[s..]);
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::message_store::insert_message_with_conn;
    use crate::memory_db::{NewMessage, Role};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Replays canned classify payloads in order.
    struct ScriptedCollaborator {
        responses: Mutex<Vec<LedgerResult<Value>>>,
        spans: Mutex<Vec<MessageSpan>>,
    }

    impl ScriptedCollaborator {
        fn new(mut responses: Vec<LedgerResult<Value>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                spans: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReasoningCollaborator for ScriptedCollaborator {
        async fn classify(&self, span: &MessageSpan) -> LedgerResult<Value> {
            self.spans.lock().unwrap().push(span.clone());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(LedgerError::CollaboratorUnavailable("script exhausted".into())))
        }

        async fn adjudicate(&self, _group: &crate::collaborator::CandidateGroup) -> LedgerResult<Value> {
            Ok(json!({"merges": []}))
        }
    }

    fn seed(db: &MemoryDatabase, count: usize) {
        let conn = db.get_conn().unwrap();
        for i in 0..count {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let content = format!("message {}", i);
            insert_message_with_conn(
                &conn,
                NewMessage {
                    user_id: "alice",
                    platform: "slack",
                    platform_msg_id: None,
                    role,
                    content: &content,
                    tool_calls: None,
                    function_call: None,
                    tool_call_id: None,
                    sent_at: None,
                },
            )
            .unwrap();
        }
    }

    fn engine(db: &Arc<MemoryDatabase>, collaborator: Arc<ScriptedCollaborator>, max_span: usize) -> TopicEngine {
        TopicEngine::new(
            Arc::clone(db),
            collaborator,
            TopicConfig {
                max_span_messages: max_span,
                ..TopicConfig::default()
            },
            Duration::from_secs(5),
        )
    }

    fn classification(name: &str, memories: Value) -> LedgerResult<Value> {
        Ok(json!({"topic_name": name, "memories": memories}))
    }

    // ===== Scanning =====

    #[tokio::test]
    async fn test_similar_spans_extend_one_topic() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 8);
        let collaborator = ScriptedCollaborator::new(vec![
            classification("Japan trip", json!([{"text": "Flying to Tokyo in May", "tags": ["travel", "japan"]}])),
            classification("japan trip planning", json!([])),
        ]);
        let engine = engine(&db, Arc::clone(&collaborator), 4);

        let report = engine.scan_topics("alice", &AtomicBool::new(false)).await.unwrap();

        assert_eq!(report.spans_classified, 2);
        assert_eq!(report.topics_created, 1);
        assert_eq!(report.topics_extended, 1);
        assert_eq!(report.memories_created, 1);

        let topics = db.topics.list_for_user("alice").unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!((topics[0].range_start, topics[0].range_end), (1, 8));

        let spans = collaborator.spans.lock().unwrap();
        assert_eq!(spans[1].preceding_topic.as_deref(), Some("Japan trip"));
    }

    #[tokio::test]
    async fn test_dissimilar_span_creates_new_topic() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 4);
        let collaborator = ScriptedCollaborator::new(vec![
            classification("Japan trip", json!([])),
            classification("Tax return", json!([])),
        ]);
        let report = engine(&db, collaborator, 2)
            .scan_topics("alice", &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(report.topics_created, 2);
        assert_eq!(db.topics.list_for_user("alice").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_span_defers_rest_of_run() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 6);
        let collaborator = ScriptedCollaborator::new(vec![
            Ok(json!({"memories": []})),
            classification("never used", json!([])),
        ]);
        let report = engine(&db, Arc::clone(&collaborator), 2)
            .scan_topics("alice", &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(report.failed_spans, 1);
        assert_eq!(report.deferred_spans, 2);
        assert_eq!(report.spans_classified, 0);
        assert!(db.topics.list_for_user("alice").unwrap().is_empty());
        assert_eq!(collaborator.spans.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_short_trailing_span_is_deferred() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 5);
        let collaborator = ScriptedCollaborator::new(vec![
            classification("Cooking", json!([])),
            classification("Cooking", json!([])),
        ]);
        let report = engine(&db, collaborator, 2)
            .scan_topics("alice", &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(report.spans_classified, 2);
        assert_eq!(report.deferred_spans, 1);
        let buffer = db.messages.get_buffer("alice", None, None).unwrap();
        assert!(buffer[4].topic_id.is_none());
        assert!(buffer[3].topic_id.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_scan_stops_before_first_span() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 4);
        let collaborator = ScriptedCollaborator::new(vec![classification("x", json!([]))]);
        let report = engine(&db, Arc::clone(&collaborator), 2)
            .scan_topics("alice", &AtomicBool::new(true))
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(collaborator.spans.lock().unwrap().is_empty());
    }

    /// Answers every span with the same topic after a delay, optionally letting
    /// another writer claim the span while the call is in flight.
    struct SlowCollaborator {
        calls: std::sync::atomic::AtomicUsize,
        interloper: Option<Arc<MemoryDatabase>>,
    }

    impl SlowCollaborator {
        fn new(interloper: Option<Arc<MemoryDatabase>>) -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::atomic::AtomicUsize::new(0),
                interloper,
            })
        }
    }

    #[async_trait]
    impl ReasoningCollaborator for SlowCollaborator {
        async fn classify(&self, span: &MessageSpan) -> LedgerResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            if let Some(db) = &self.interloper {
                let conn = db.get_conn()?;
                let topic = create_topic_with_conn(&conn, &span.user_id, "Claimed elsewhere", span.start, span.end)?;
                set_topic_for_range_with_conn(&conn, &span.user_id, &topic.id, span.start, span.end)?;
            }
            classification("Japan trip", json!([{"text": "Flying to Tokyo in May", "tags": ["travel", "japan"]}]))
        }

        async fn adjudicate(&self, _group: &crate::collaborator::CandidateGroup) -> LedgerResult<Value> {
            Ok(json!({"merges": []}))
        }
    }

    #[tokio::test]
    async fn test_concurrent_scans_apply_each_span_once() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 4);
        let collaborator = SlowCollaborator::new(None);
        let engine = TopicEngine::new(
            Arc::clone(&db),
            Arc::clone(&collaborator) as Arc<dyn ReasoningCollaborator>,
            TopicConfig {
                max_span_messages: 4,
                ..TopicConfig::default()
            },
            Duration::from_secs(5),
        );

        let cancel = AtomicBool::new(false);
        let (first, second) = tokio::join!(engine.scan_topics("alice", &cancel), engine.scan_topics("alice", &cancel));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.topics_created + second.topics_created, 1);
        assert_eq!(first.memories_created + second.memories_created, 1);
        assert_eq!(collaborator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.topics.list_for_user("alice").unwrap().len(), 1);
        assert_eq!(db.memories.count().unwrap(), 1);
        assert!(engine.scan_locks.is_empty());
    }

    #[tokio::test]
    async fn test_span_claimed_during_classification_is_not_applied() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 4);
        let collaborator = SlowCollaborator::new(Some(Arc::clone(&db)));
        let engine = TopicEngine::new(
            Arc::clone(&db),
            collaborator,
            TopicConfig {
                max_span_messages: 4,
                ..TopicConfig::default()
            },
            Duration::from_secs(5),
        );

        let report = engine.scan_topics("alice", &AtomicBool::new(false)).await.unwrap();

        assert_eq!(report.stale_spans, 1);
        assert_eq!(report.spans_classified, 0);
        assert_eq!(report.memories_created, 0);
        let topics = db.topics.list_for_user("alice").unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, "Claimed elsewhere");
        assert_eq!(db.memories.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_scan() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 4);
        db.get_conn().unwrap().execute_batch("DROP TABLE topics").unwrap();
        let collaborator = ScriptedCollaborator::new(vec![classification("Japan trip", json!([]))]);

        let result = engine(&db, collaborator, 4)
            .scan_topics("alice", &AtomicBool::new(false))
            .await;

        assert!(matches!(result, Err(LedgerError::Storage(_))));
    }

    // ===== Manual assignment =====

    #[tokio::test]
    async fn test_assign_topic_requires_contiguity() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 6);
        let collaborator = ScriptedCollaborator::new(vec![classification("Japan trip", json!([]))]);
        let engine = engine(&db, collaborator, 2);
        engine.scan_topics("alice", &AtomicBool::new(false)).await.unwrap();
        let topic = db.topics.list_for_user("alice").unwrap().remove(0);
        assert_eq!((topic.range_start, topic.range_end), (1, 2));

        assert!(matches!(engine.assign_topic(&topic.id, 5, 6), Err(LedgerError::Validation(_))));
        assert!(matches!(engine.assign_topic(&topic.id, 4, 3), Err(LedgerError::Validation(_))));

        let outcome = engine.assign_topic(&topic.id, 3, 4).unwrap();
        assert_eq!(outcome.messages_tagged, 2);
        assert_eq!((outcome.topic.range_start, outcome.topic.range_end), (1, 4));

        assert!(matches!(engine.assign_topic("missing", 1, 1), Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_assign_topic_rejects_foreign_messages() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, 4);
        let collaborator = ScriptedCollaborator::new(vec![
            classification("Japan trip", json!([])),
            classification("Tax return", json!([])),
        ]);
        let engine = engine(&db, collaborator, 2);
        engine.scan_topics("alice", &AtomicBool::new(false)).await.unwrap();
        let topics = db.topics.list_for_user("alice").unwrap();

        let result = engine.assign_topic(&topics[0].id, 2, 3);
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_untagged_runs_split_on_tagged_messages() {
        let mut rows: Vec<CanonicalMessage> = (1..=5)
            .map(|seq| CanonicalMessage {
                id: seq,
                user_id: "alice".into(),
                sequence: seq,
                platform: "slack".into(),
                platform_msg_id: None,
                role: Role::User,
                content: String::new(),
                content_hash: String::new(),
                tool_calls: None,
                function_call: None,
                tool_call_id: None,
                topic_id: None,
                sent_at: None,
                created_at: chrono::Utc::now(),
                superseded: false,
            })
            .collect();
        rows[2].topic_id = Some("t".into());

        let runs = untagged_runs(&rows);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1].len(), 2);
    }
}
