use crate::utils::TextUtils;

/// Decides whether a proposed topic name continues an existing topic.
pub trait TopicSimilarity: Send + Sync {
    /// Similarity in `[0, 1]`.
    fn score(&self, existing: &str, proposed: &str) -> f64;

    fn is_similar(&self, existing: &str, proposed: &str, threshold: f64) -> bool {
        self.score(existing, proposed) >= threshold
    }
}

/// Exact match, then substring containment, then stop-word-filtered token overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalSimilarity;

const CONTAINMENT_SCORE: f64 = 0.9;
const MIN_CONTAINED_CHARS: usize = 3;

impl TopicSimilarity for LexicalSimilarity {
    fn score(&self, existing: &str, proposed: &str) -> f64 {
        let a = TextUtils::normalize_keyword(existing);
        let b = TextUtils::normalize_keyword(proposed);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }

        let (shorter, longer) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
        if shorter.chars().count() >= MIN_CONTAINED_CHARS && longer.contains(shorter.as_str()) {
            return CONTAINMENT_SCORE;
        }

        let tokens_a = TextUtils::token_set(&a);
        let tokens_b = TextUtils::token_set(&b);
        let union = tokens_a.union(&tokens_b).count();
        if union == 0 {
            return 0.0;
        }
        tokens_a.intersection(&tokens_b).count() as f64 / union as f64
    }
}
