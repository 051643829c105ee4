use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::{respond, ApiError};
use crate::memory_db::{MemoryEntry, NewMemory};
use crate::search::{SearchFilters, SearchOutcome};
use crate::shared_state::SharedState;

pub async fn create(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<NewMemory>,
) -> Result<(StatusCode, Json<MemoryEntry>), ApiError> {
    respond("create_memory", state.create_memory(&payload).await).map(|entry| (StatusCode::CREATED, entry))
}

pub async fn get(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<i64>,
) -> Result<Json<MemoryEntry>, ApiError> {
    respond("get_memory", state.get_memory(id))
}

pub async fn update(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<i64>,
    Json(payload): Json<NewMemory>,
) -> Result<Json<MemoryEntry>, ApiError> {
    respond("update_memory", state.update_memory(id, &payload).await)
}

pub async fn delete(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    respond("delete_memory", state.delete_memory(id).await).map(|_| StatusCode::NO_CONTENT)
}

pub async fn link_topic(
    State(state): State<Arc<SharedState>>,
    Path((id, topic_id)): Path<(i64, String)>,
) -> Result<Json<MemoryEntry>, ApiError> {
    respond("link_memory_topic", state.link_memory_topic(id, &topic_id))
}

pub async fn unlink_topic(
    State(state): State<Arc<SharedState>>,
    Path((id, topic_id)): Path<(i64, String)>,
) -> Result<Json<MemoryEntry>, ApiError> {
    respond("unlink_memory_topic", state.unlink_memory_topic(id, &topic_id))
}

pub async fn search(
    State(state): State<Arc<SharedState>>,
    Json(filters): Json<SearchFilters>,
) -> Result<Json<SearchOutcome>, ApiError> {
    respond("search", state.search(&filters))
}
