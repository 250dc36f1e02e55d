//! Cache error handling
//!
//! Provides typed errors for cache operations. Errors are `Clone` because a
//! single propagation failure is fanned out to the mutation handle and to
//! every failure subscriber.

use thiserror::Error;

use crate::backend::BackendOperation;

/// Errors that can occur while loading or reconciling the cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A backend call rejected
    #[error("Backend {operation} failed: {message}")]
    Backend {
        operation: BackendOperation,
        message: String,
    },

    /// The mutation was never sent because an earlier one rolled back
    #[error("Mutation on '{url}' was discarded by an earlier rollback")]
    Superseded { url: String },

    /// The background task panicked or was cancelled
    #[error("Background task for '{url}' did not complete: {details}")]
    TaskAborted { url: String, details: String },

    /// No Tokio runtime was available to propagate the mutation, so it
    /// was not applied
    #[error("No async runtime to propagate mutation on '{url}'")]
    NoRuntime { url: String },
}

impl CacheError {
    /// Wrap a backend adapter error, keeping its cause chain in the message
    pub fn backend(operation: BackendOperation, error: anyhow::Error) -> Self {
        CacheError::Backend {
            operation,
            message: format!("{:#}", error),
        }
    }

    /// Check if this error came from the backend
    pub fn is_backend(&self) -> bool {
        matches!(self, CacheError::Backend { .. })
    }

    /// The backend operation that failed, if any
    pub fn operation(&self) -> Option<BackendOperation> {
        match self {
            CacheError::Backend { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
