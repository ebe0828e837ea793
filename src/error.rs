use thiserror::Error;

pub type Result<T> = std::result::Result<T, BatonError>;

/// Unified error type for the orchestration engine.
#[derive(Debug, Error)]
pub enum BatonError {
    /// The target of an interrupt/resume is not in an applicable state.
    /// Recovered locally by callers and surfaced as a failed registration.
    #[error("invalid state for {entity} '{id}': {message}")]
    InvalidState {
        entity: &'static str,
        id: String,
        message: String,
    },

    /// A resume arrived for an already-consumed or unknown correlation id.
    /// External delivery is at-least-once, so callers treat this as a no-op.
    #[error("correlation '{0}' already consumed or unknown")]
    DuplicateCorrelation(String),

    /// Internal signal; the adviser converts it to MarkFailed advice before
    /// it can reach a caller.
    #[error("retries exhausted for node execution '{node_execution_id}' after {attempts} attempts")]
    RetryExhausted {
        node_execution_id: String,
        attempts: u32,
    },

    /// One sibling in a step-group retry could not be re-queued; the whole
    /// group retry was rolled back.
    #[error("step-group retry rolled back ({group_size} siblings): {message}")]
    GroupRetryPartialFailure { group_size: usize, message: String },

    #[error("{entity} not found: '{id}'")]
    NotFound { entity: &'static str, id: String },

    #[error("storage operation failed: {operation}")]
    Storage {
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("serialization failed: {message}")]
    Serialization { message: String },

    #[error("plan validation failed: {message}")]
    PlanValidation { message: String },

    #[error("task dispatch failed: {message}")]
    TaskDispatch { message: String },
}

impl BatonError {
    pub fn invalid_state<S: Into<String>>(entity: &'static str, id: S, message: S) -> Self {
        BatonError::InvalidState {
            entity,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        BatonError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn storage<S: Into<String>>(
        operation: S,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BatonError::Storage {
            operation: operation.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn storage_msg<S: Into<String>>(operation: S) -> Self {
        BatonError::Storage {
            operation: operation.into(),
            source: None,
        }
    }

    /// Whether a bounded retry with backoff against the collaborator makes
    /// sense for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatonError::Storage { .. } | BatonError::TaskDispatch { .. }
        )
    }
}

impl From<sled::Error> for BatonError {
    fn from(err: sled::Error) -> Self {
        BatonError::storage("sled", err)
    }
}

impl From<bincode::Error> for BatonError {
    fn from(err: bincode::Error) -> Self {
        BatonError::Serialization {
            message: err.to_string(),
        }
    }
}
