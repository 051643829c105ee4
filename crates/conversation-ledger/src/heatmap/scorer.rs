//! Keyword heatmap state machine.
//!
//! Scores live in `[0, 1]`. A keyword enters at the score of its weight class,
//! gains ten percent of its score when mentioned again, loses a flat `0.08`
//! every cycle it is not mentioned, and leaves the set once it drops below
//! `0.1`. Time plays no part: only cycles count.

use crate::error::{LedgerError, LedgerResult};
use crate::memory_db::KeywordScoreRow;
use crate::utils::TextUtils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const REINFORCEMENT_RATE: f64 = 0.10;
pub const DECAY_PER_CYCLE: f64 = 0.08;
pub const REMOVAL_THRESHOLD: f64 = 0.1;
const SCORE_PRECISION: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightClass {
    Low,
    Medium,
    High,
}

impl WeightClass {
    pub fn initial_score(self) -> f64 {
        match self {
            WeightClass::High => 1.0,
            WeightClass::Medium => 0.7,
            WeightClass::Low => 0.5,
        }
    }
}

/// One keyword mention observed during the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordEvent {
    pub keyword: String,
    #[serde(default = "default_weight")]
    pub weight: WeightClass,
}

fn default_weight() -> WeightClass {
    WeightClass::Medium
}

impl KeywordEvent {
    pub fn new(keyword: impl Into<String>, weight: WeightClass) -> Self {
        Self { keyword: keyword.into(), weight }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KeywordScore {
    pub score: f64,
    pub last_updated: DateTime<Utc>,
}

/// The active keyword set after `cycle` completed cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeatmapState {
    pub cycle: u64,
    pub keywords: BTreeMap<String, KeywordScore>,
}

impl HeatmapState {
    pub fn from_rows(rows: Vec<KeywordScoreRow>) -> Self {
        let keywords = rows
            .into_iter()
            .map(|row| {
                (
                    row.keyword,
                    KeywordScore {
                        score: row.score,
                        last_updated: row.last_updated,
                    },
                )
            })
            .collect();
        Self { cycle: 0, keywords }
    }

    pub fn to_rows(&self) -> Vec<KeywordScoreRow> {
        self.keywords
            .iter()
            .map(|(keyword, entry)| KeywordScoreRow {
                keyword: keyword.clone(),
                score: entry.score,
                last_updated: entry.last_updated,
            })
            .collect()
    }

    pub fn score(&self, keyword: &str) -> Option<f64> {
        self.keywords.get(keyword).map(|entry| entry.score)
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickOutcome {
    pub cycle: u64,
    pub inserted: Vec<String>,
    pub reinforced: Vec<String>,
    pub decayed: usize,
    pub removed: Vec<String>,
    pub active_keywords: usize,
}

fn round_score(score: f64) -> f64 {
    (score * SCORE_PRECISION).round() / SCORE_PRECISION
}

/// Advances `state` by one cycle. Every keyword is touched at most once; a
/// keyword seen several times for the first time enters with its highest class.
pub fn tick(
    state: &HeatmapState,
    events: &[KeywordEvent],
    now: DateTime<Utc>,
) -> LedgerResult<(HeatmapState, TickOutcome)> {
    let mut mentioned: HashMap<String, WeightClass> = HashMap::new();
    for event in events {
        let keyword = TextUtils::normalize_keyword(&event.keyword);
        if keyword.is_empty() {
            return Err(LedgerError::validation("heatmap keywords must not be empty"));
        }
        mentioned
            .entry(keyword)
            .and_modify(|weight| *weight = (*weight).max(event.weight))
            .or_insert(event.weight);
    }

    let mut outcome = TickOutcome {
        cycle: state.cycle + 1,
        ..Default::default()
    };
    let mut keywords = BTreeMap::new();

    for (keyword, entry) in &state.keywords {
        let score = if mentioned.contains_key(keyword) {
            outcome.reinforced.push(keyword.clone());
            round_score((entry.score + REINFORCEMENT_RATE * entry.score).min(1.0))
        } else {
            outcome.decayed += 1;
            round_score(entry.score - DECAY_PER_CYCLE)
        };

        if score < REMOVAL_THRESHOLD {
            outcome.removed.push(keyword.clone());
            continue;
        }
        keywords.insert(keyword.clone(), KeywordScore { score, last_updated: now });
    }

    let mut fresh: Vec<(String, WeightClass)> = mentioned
        .into_iter()
        .filter(|(keyword, _)| !state.keywords.contains_key(keyword))
        .collect();
    fresh.sort();
    for (keyword, weight) in fresh {
        keywords.insert(
            keyword.clone(),
            KeywordScore {
                score: weight.initial_score(),
                last_updated: now,
            },
        );
        outcome.inserted.push(keyword);
    }

    outcome.active_keywords = keywords.len();
    Ok((
        HeatmapState {
            cycle: state.cycle + 1,
            keywords,
        },
        outcome,
    ))
}

/// Sum of the active scores of `tags`; tags outside the active set add nothing.
pub fn memory_relevance<S: AsRef<str>>(state: &HeatmapState, tags: &[S]) -> f64 {
    let total: f64 = tags
        .iter()
        .filter_map(|tag| state.score(&TextUtils::normalize_keyword(tag.as_ref())))
        .sum();
    round_score(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(state: &HeatmapState, events: &[KeywordEvent]) -> HeatmapState {
        tick(state, events, Utc::now()).unwrap().0
    }

    fn state_with(pairs: &[(&str, f64)]) -> HeatmapState {
        let now = Utc::now();
        HeatmapState {
            cycle: 0,
            keywords: pairs
                .iter()
                .map(|(k, s)| (k.to_string(), KeywordScore { score: *s, last_updated: now }))
                .collect(),
        }
    }

    // ===== Weight classes =====

    #[test]
    fn test_first_occurrence_uses_weight_class() {
        let state = run(
            &HeatmapState::default(),
            &[
                KeywordEvent::new("deploy", WeightClass::High),
                KeywordEvent::new("kubernetes", WeightClass::Medium),
                KeywordEvent::new("staging", WeightClass::Low),
            ],
        );
        assert_eq!(state.score("deploy"), Some(1.0));
        assert_eq!(state.score("kubernetes"), Some(0.7));
        assert_eq!(state.score("staging"), Some(0.5));
        assert_eq!(state.cycle, 1);
    }

    #[test]
    fn test_highest_class_wins_within_a_cycle() {
        let state = run(
            &HeatmapState::default(),
            &[
                KeywordEvent::new("Deploy", WeightClass::Low),
                KeywordEvent::new("deploy ", WeightClass::High),
            ],
        );
        assert_eq!(state.len(), 1);
        assert_eq!(state.score("deploy"), Some(1.0));
    }

    // ===== Reinforcement and decay =====

    #[test]
    fn test_reinforcement_is_capped_at_one() {
        let high = [KeywordEvent::new("deploy", WeightClass::High)];
        let mut state = run(&HeatmapState::default(), &high);
        state = run(&state, &high);
        state = run(&state, &high);
        assert_eq!(state.score("deploy"), Some(1.0));
    }

    #[test]
    fn test_reinforcement_adds_ten_percent() {
        let low = [KeywordEvent::new("rust", WeightClass::Low)];
        let state = run(&run(&HeatmapState::default(), &low), &low);
        assert_eq!(state.score("rust"), Some(0.55));
    }

    #[test]
    fn test_repeated_mentions_reinforce_once() {
        let state = state_with(&[("rust", 0.5)]);
        let events = vec![KeywordEvent::new("rust", WeightClass::Low); 5];
        let (next, outcome) = tick(&state, &events, Utc::now()).unwrap();
        assert_eq!(next.score("rust"), Some(0.55));
        assert_eq!(outcome.reinforced, vec!["rust".to_string()]);
    }

    #[test]
    fn test_low_keyword_survives_five_cycles_then_leaves() {
        let mut state = state_with(&[("staging", 0.5)]);
        for _ in 0..5 {
            state = run(&state, &[]);
        }
        assert_eq!(state.score("staging"), Some(0.1));

        let (state, outcome) = tick(&state, &[], Utc::now()).unwrap();
        assert!(state.score("staging").is_none());
        assert_eq!(outcome.removed, vec!["staging".to_string()]);
    }

    #[test]
    fn test_empty_keyword_is_rejected() {
        let result = tick(&HeatmapState::default(), &[KeywordEvent::new("  ", WeightClass::High)], Utc::now());
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    // ===== Memory relevance =====

    #[test]
    fn test_memory_relevance_sums_active_tags() {
        let state = state_with(&[("deploy", 0.8), ("kubernetes", 0.6)]);
        let score = memory_relevance(&state, &["deploy", "kubernetes", "staging"]);
        assert_eq!(score, 1.4);
    }

    #[test]
    fn test_removed_keywords_do_not_count() {
        let state = run(&state_with(&[("deploy", 0.15), ("rust", 0.9)]), &[]);
        assert_eq!(memory_relevance(&state, &["deploy", "rust"]), 0.82);
    }

    // ===== Properties =====

    fn weight_strategy() -> impl Strategy<Value = WeightClass> {
        prop_oneof![
            Just(WeightClass::Low),
            Just(WeightClass::Medium),
            Just(WeightClass::High)
        ]
    }

    proptest! {
        #[test]
        fn test_scores_stay_within_bounds(
            cycles in prop::collection::vec(
                prop::collection::vec(("[a-e]", weight_strategy()), 0..6),
                1..40,
            )
        ) {
            let mut state = HeatmapState::default();
            for events in cycles {
                let events: Vec<KeywordEvent> = events
                    .into_iter()
                    .map(|(keyword, weight)| KeywordEvent::new(keyword, weight))
                    .collect();
                state = run(&state, &events);
                for entry in state.keywords.values() {
                    prop_assert!(entry.score >= REMOVAL_THRESHOLD);
                    prop_assert!(entry.score <= 1.0);
                }
            }
        }

        #[test]
        fn test_unmentioned_keywords_never_grow(
            initial in 0.1f64..=1.0,
            cycles in 1usize..20,
        ) {
            let mut state = state_with(&[("k", (initial * 1e6).round() / 1e6)]);
            let mut previous = state.score("k").unwrap_or(0.0);
            for _ in 0..cycles {
                state = run(&state, &[]);
                let current = state.score("k").unwrap_or(0.0);
                prop_assert!(current < previous || current == 0.0);
                previous = current;
            }
        }
    }
}
