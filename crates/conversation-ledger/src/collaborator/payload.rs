use crate::error::{LedgerError, LedgerResult};
use crate::utils::TextUtils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Validated `classify` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub topic_name: String,
    #[serde(default)]
    pub memories: Vec<ExtractedMemory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedMemory {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

fn invalid(what: &str, detail: impl std::fmt::Display) -> LedgerError {
    LedgerError::validation(format!("invalid {} payload: {}", what, detail))
}

fn clean_category(what: &str, category: Option<&str>) -> LedgerResult<Option<String>> {
    match category.map(str::trim) {
        Some("") => Err(invalid(what, "category must not be empty when present")),
        other => Ok(other.map(str::to_string)),
    }
}

impl Classification {
    /// Parses and normalises a raw payload. Every memory must carry text and at
    /// least one tag; the topic name is required.
    pub fn from_payload(value: serde_json::Value) -> LedgerResult<Self> {
        let raw: Classification = serde_json::from_value(value).map_err(|e| invalid("classification", e))?;

        let topic_name = TextUtils::normalize_whitespace(&raw.topic_name).into_owned();
        if topic_name.is_empty() {
            return Err(invalid("classification", "topic_name is required"));
        }

        let mut memories = Vec::with_capacity(raw.memories.len());
        for (index, memory) in raw.memories.into_iter().enumerate() {
            let text = memory.text.trim();
            if text.is_empty() {
                return Err(invalid("classification", format!("memory {} has no text", index)));
            }
            let tags = TextUtils::normalize_tags(&memory.tags);
            if tags.is_empty() {
                return Err(invalid("classification", format!("memory {} has no tags", index)));
            }
            memories.push(ExtractedMemory {
                text: text.to_string(),
                tags,
                category: clean_category("classification", memory.category.as_deref())?,
            });
        }

        Ok(Self { topic_name, memories })
    }
}

/// Validated `adjudicate` payload. An empty `merges` list means keep everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MergePlan {
    #[serde(default)]
    pub merges: Vec<MergeDecision>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeDecision {
    pub keep_id: i64,
    #[serde(default)]
    pub absorb_ids: Vec<i64>,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl MergePlan {
    /// Parses a plan and checks it only refers to `members`, with every id used at most once.
    pub fn from_payload(value: serde_json::Value, members: &BTreeSet<i64>) -> LedgerResult<Self> {
        let raw: MergePlan = serde_json::from_value(value).map_err(|e| invalid("merge plan", e))?;
        let mut used = BTreeSet::new();
        let mut merges = Vec::with_capacity(raw.merges.len());

        for decision in raw.merges {
            for id in std::iter::once(decision.keep_id).chain(decision.absorb_ids.iter().copied()) {
                if !members.contains(&id) {
                    return Err(invalid("merge plan", format!("memory {} is not in the group", id)));
                }
                if !used.insert(id) {
                    return Err(invalid("merge plan", format!("memory {} appears twice", id)));
                }
            }

            let text = decision.text.trim();
            if text.is_empty() {
                return Err(invalid("merge plan", format!("merge into {} has no text", decision.keep_id)));
            }
            let tags = TextUtils::normalize_tags(&decision.tags);
            if tags.is_empty() {
                return Err(invalid("merge plan", format!("merge into {} has no tags", decision.keep_id)));
            }

            merges.push(MergeDecision {
                keep_id: decision.keep_id,
                absorb_ids: decision.absorb_ids,
                text: text.to_string(),
                tags,
                category: clean_category("merge plan", decision.category.as_deref())?,
            });
        }

        Ok(Self { merges })
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn members(ids: &[i64]) -> BTreeSet<i64> {
        ids.iter().copied().collect()
    }

    // ===== Classification =====

    #[test]
    fn test_classification_is_normalized() {
        let parsed = Classification::from_payload(json!({
            "topic_name": "  Trip   planning ",
            "memories": [{"text": " Likes aisle seats ", "tags": ["Travel", "travel"], "category": "Preferences"}]
        }))
        .unwrap();

        assert_eq!(parsed.topic_name, "Trip planning");
        assert_eq!(parsed.memories[0].text, "Likes aisle seats");
        assert_eq!(parsed.memories[0].tags, vec!["travel".to_string()]);
    }

    #[test]
    fn test_classification_without_memories_is_valid() {
        let parsed = Classification::from_payload(json!({"topic_name": "smalltalk"})).unwrap();
        assert!(parsed.memories.is_empty());
    }

    #[test]
    fn test_classification_violations() {
        for payload in [
            json!({"memories": []}),
            json!({"topic_name": " "}),
            json!({"topic_name": "t", "memories": [{"text": "", "tags": ["a"]}]}),
            json!({"topic_name": "t", "memories": [{"text": "x", "tags": []}]}),
            json!({"topic_name": "t", "memories": [{"text": "x", "tags": ["a"], "category": ""}]}),
            json!("just a string"),
        ] {
            assert!(
                matches!(Classification::from_payload(payload.clone()), Err(LedgerError::Validation(_))),
                "accepted {}",
                payload
            );
        }
    }

    // ===== Merge plans =====

    #[test]
    fn test_valid_merge_plan() {
        let plan = MergePlan::from_payload(
            json!({"merges": [{"keep_id": 1, "absorb_ids": [2, 3], "text": "merged", "tags": ["A"]}]}),
            &members(&[1, 2, 3, 4]),
        )
        .unwrap();
        assert_eq!(plan.merges[0].tags, vec!["a".to_string()]);
        assert!(MergePlan::from_payload(json!({"merges": []}), &members(&[1])).unwrap().is_empty());
    }

    #[test]
    fn test_merge_plan_rejects_foreign_and_repeated_ids() {
        let group = members(&[1, 2, 3]);
        let foreign = json!({"merges": [{"keep_id": 1, "absorb_ids": [9], "text": "t", "tags": ["a"]}]});
        let self_absorb = json!({"merges": [{"keep_id": 1, "absorb_ids": [1], "text": "t", "tags": ["a"]}]});
        let overlapping = json!({"merges": [
            {"keep_id": 1, "absorb_ids": [2], "text": "t", "tags": ["a"]},
            {"keep_id": 3, "absorb_ids": [2], "text": "t", "tags": ["a"]}
        ]});
        let untagged = json!({"merges": [{"keep_id": 1, "absorb_ids": [2], "text": "t", "tags": []}]});

        for payload in [foreign, self_absorb, overlapping, untagged] {
            assert!(MergePlan::from_payload(payload, &group).is_err());
        }
    }
}
