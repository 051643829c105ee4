//! Maintenance and operational endpoints.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::{respond, ApiError};
use crate::dedup::DedupReport;
use crate::shared_state::{LedgerStats, SharedState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn stats(State(state): State<Arc<SharedState>>) -> Result<Json<LedgerStats>, ApiError> {
    respond("stats", state.stats())
}

pub async fn run_dedup(State(state): State<Arc<SharedState>>) -> Result<Json<DedupReport>, ApiError> {
    let cancel = AtomicBool::new(false);
    respond("dedup", state.run_dedup(&cancel).await)
}

#[derive(Debug, Serialize)]
pub struct MaintenanceResponse {
    pub status: &'static str,
}

pub async fn maintenance(State(state): State<Arc<SharedState>>) -> Result<Json<MaintenanceResponse>, ApiError> {
    respond("maintenance", state.run_maintenance().map(|_| MaintenanceResponse { status: "ok" }))
}
