//! Error taxonomy shared by every ledger component.
//!
//! A sync batch that cannot be aligned is not an error: it is appended and
//! reported through `SyncOutcome::conflict`.

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Storage and collaborator failures leave no partial state behind, so the
    /// caller may safely repeat the whole unit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Pool(_) | Self::CollaboratorUnavailable(_)
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_retryable() {
        let err = LedgerError::from(rusqlite::Error::InvalidQuery);
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("storage error"));
    }

    #[test]
    fn test_validation_errors_are_not_retryable() {
        let err = LedgerError::validation("bad timestamp");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "validation error: bad timestamp");
    }

    #[test]
    fn test_collaborator_errors_are_retryable() {
        assert!(LedgerError::CollaboratorUnavailable("timeout".into()).is_retryable());
        assert!(!LedgerError::not_found("memory 7").is_retryable());
    }
}
