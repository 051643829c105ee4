use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::{respond, ApiError};
use crate::memory_db::Topic;
use crate::shared_state::SharedState;
use crate::topics::{AssignOutcome, ScanReport};

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub start: i64,
    pub end: i64,
}

pub async fn scan(
    State(state): State<Arc<SharedState>>,
    Path(user_id): Path<String>,
) -> Result<Json<ScanReport>, ApiError> {
    let cancel = AtomicBool::new(false);
    respond("scan_topics", state.scan_topics(&user_id, &cancel).await)
}

pub async fn list(
    State(state): State<Arc<SharedState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Topic>>, ApiError> {
    respond("list_topics", state.topics_for_user(&user_id))
}

pub async fn get(
    State(state): State<Arc<SharedState>>,
    Path(topic_id): Path<String>,
) -> Result<Json<Topic>, ApiError> {
    respond("get_topic", state.get_topic(&topic_id))
}

pub async fn assign(
    State(state): State<Arc<SharedState>>,
    Path(topic_id): Path<String>,
    Json(payload): Json<AssignRequest>,
) -> Result<Json<AssignOutcome>, ApiError> {
    respond("assign_topic", state.assign_topic(&topic_id, payload.start, payload.end))
}

pub async fn delete(
    State(state): State<Arc<SharedState>>,
    Path(topic_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    respond("delete_topic", state.delete_topic(&topic_id)).map(|_| StatusCode::NO_CONTENT)
}
