//! Text normalisation shared by tags, keywords and topic names

use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
    static ref TOKEN_REGEX: Regex = Regex::new(r"[\p{L}\p{N}]+").unwrap();
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
        "of", "with", "by", "is", "am", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "do", "does", "did", "will", "would",
        "shall", "should", "may", "might", "must", "can", "could", "i", "you",
        "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
        "my", "your", "his", "its", "our", "their", "this", "that", "these",
        "those", "about", "from", "into", "over", "some", "new",
    ]
    .into_iter()
    .collect();
}

pub struct TextUtils;

impl TextUtils {
    /// Collapse whitespace runs into single spaces and trim the ends
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) || text.trim().len() != text.len() {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text.trim(), " ").into_owned())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Canonical form for tags, heatmap keywords and topic names.
    pub fn normalize_keyword(raw: &str) -> String {
        Self::normalize_whitespace(raw).to_lowercase()
    }

    /// Normalises every tag, drops empties and duplicates, keeps first-seen order.
    pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        tags.into_iter()
            .map(|tag| Self::normalize_keyword(tag.as_ref()))
            .filter(|tag| !tag.is_empty())
            .filter(|tag| seen.insert(tag.clone()))
            .collect()
    }

    pub fn is_stop_word(word: &str) -> bool {
        STOP_WORDS.contains(word)
    }

    /// Lowercased word tokens with stop words removed.
    pub fn token_set(text: &str) -> BTreeSet<String> {
        let lowered = text.to_lowercase();
        TOKEN_REGEX
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .filter(|word| !Self::is_stop_word(word))
            .map(str::to_string)
            .collect()
    }

    /// Truncate text to max length with ellipsis if needed
    pub fn truncate_with_ellipsis(text: &str, max_len: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_len {
            Cow::Borrowed(text)
        } else if max_len <= 3 {
            Cow::Borrowed("...")
        } else {
            let kept: String = text.chars().take(max_len - 3).collect();
            Cow::Owned(format!("{}...", kept))
        }
    }
}
