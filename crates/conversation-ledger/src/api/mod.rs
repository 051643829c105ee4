//! HTTP handlers over `SharedState`.

pub mod admin_api;
pub mod buffer_api;
pub mod heatmap_api;
pub mod memory_api;
pub mod topic_api;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::metrics;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({
                "error": self.message,
                "code": self.status.as_u16(),
            })),
        )
            .into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::CollaboratorUnavailable(_) | LedgerError::Storage(_) | LedgerError::Pool(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LedgerError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

/// Records the request outcome and turns the result into a JSON response.
pub(crate) fn respond<T: Serialize>(route: &'static str, result: LedgerResult<T>) -> Result<Json<T>, ApiError> {
    match result {
        Ok(value) => {
            metrics::inc_request(route, "ok");
            Ok(Json(value))
        }
        Err(e) => {
            let err = ApiError::from(e);
            if err.status.is_server_error() {
                error!("{} failed: {}", route, err.message);
                metrics::inc_request(route, "error");
            } else {
                warn!("{} rejected: {}", route, err.message);
                metrics::inc_request(route, "rejected");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ApiError::from(LedgerError::validation("x")).status, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(LedgerError::not_found("x")).status, StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(LedgerError::CollaboratorUnavailable("x".into())).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(LedgerError::Storage(rusqlite::Error::InvalidQuery)).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
