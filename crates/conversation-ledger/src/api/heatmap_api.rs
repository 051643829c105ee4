use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::{respond, ApiError};
use crate::heatmap::{KeywordEvent, ScoredMemory, TickOutcome};
use crate::shared_state::SharedState;

const DEFAULT_TOP_N: usize = 10;
const MAX_TOP_N: usize = 100;

#[derive(Debug, Deserialize)]
pub struct TickRequest {
    #[serde(default)]
    pub events: Vec<KeywordEvent>,
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub n: Option<usize>,
}

pub async fn tick(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<TickRequest>,
) -> Result<Json<TickOutcome>, ApiError> {
    respond("heatmap_tick", state.update_heatmap(&payload.events).await)
}

pub async fn top(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<ScoredMemory>>, ApiError> {
    let n = query.n.unwrap_or(DEFAULT_TOP_N).min(MAX_TOP_N);
    respond("heatmap_top", state.top_memories(n))
}
