use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{respond, ApiError};
use crate::memory_db::{parse_filter_timestamp, CanonicalMessage, RawMessage};
use crate::shared_state::SharedState;
use crate::sync_engine::SyncOutcome;

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
pub struct BufferQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub deleted: usize,
}

pub async fn sync(
    State(state): State<Arc<SharedState>>,
    Path(user_id): Path<String>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncOutcome>, ApiError> {
    info!("Sync request for user {} with {} messages", user_id, payload.messages.len());
    respond("sync", state.sync(&user_id, &payload.messages).await)
}

pub async fn buffer(
    State(state): State<Arc<SharedState>>,
    Path(user_id): Path<String>,
    Query(query): Query<BufferQuery>,
) -> Result<Json<Vec<CanonicalMessage>>, ApiError> {
    respond("buffer", state.buffer(&user_id, query.limit, query.offset))
}

pub async fn purge(
    State(state): State<Arc<SharedState>>,
    Path(user_id): Path<String>,
    Query(query): Query<PurgeQuery>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let result = parse_filter_timestamp("from", &query.from)
        .and_then(|from| Ok((from, parse_filter_timestamp("to", &query.to)?)))
        .and_then(|(from, to)| state.purge_messages(&user_id, &from, &to))
        .map(|deleted| PurgeResponse { deleted });
    respond("purge", result)
}
