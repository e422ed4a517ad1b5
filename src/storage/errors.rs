//! Storage error types.

use crate::error::{CseError, ResponseStatusCode};

/// Errors raised by [`super::Storage`] implementations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// No resource stored under the identifier
    #[error("resource '{ri}' not found")]
    NotFound { ri: String },

    /// A write would break a uniqueness invariant (duplicate `ri`,
    /// sibling `rn` collision, duplicate `srn`)
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Backend failure
    #[error("storage failure: {message}")]
    Backend { message: String },
}

impl StorageError {
    pub fn not_found(ri: impl Into<String>) -> Self {
        Self::NotFound { ri: ri.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }
}

impl From<StorageError> for CseError {
    fn from(err: StorageError) -> Self {
        let rsc = match &err {
            StorageError::NotFound { .. } => ResponseStatusCode::NotFound,
            StorageError::Conflict { .. } => ResponseStatusCode::Conflict,
            StorageError::Backend { .. } => ResponseStatusCode::InternalServerError,
        };
        CseError::with_debug(rsc, err.to_string())
    }
}
