//! Keyword heatmap - decaying relevance weights per keyword and the
//! per-memory scores derived from them.

pub mod scorer;
pub mod service;

pub use scorer::{memory_relevance, tick, HeatmapState, KeywordEvent, KeywordScore, TickOutcome, WeightClass};
pub use service::{HeatmapService, HeatmapSnapshot, ScoredMemory};
