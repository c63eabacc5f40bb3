use thiserror::Error;

/// Result type used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// `SerializationConflict` is transient: the transaction coordinator retries
/// it transparently up to a bound before handing it to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Entity or version absent for the given logical id in the given parent.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate name/id, already-exists, branch-has-children.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed identifier, empty batch, duplicate ids within a batch,
    /// schema/data validation failure.
    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        /// JSON pointer to the offending value, when one exists.
        pointer: Option<String>,
    },

    /// Operation requires a state the entity is not in (no changes to
    /// commit/revert, branching from a draft, ...).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Blocked delete due to live foreign-key/reference usage.
    #[error("referential integrity: {0}")]
    ReferentialIntegrity(String),

    /// Storage-engine-detected concurrent-write hazard.
    #[error("serialization conflict, please retry transaction")]
    SerializationConflict,

    /// Permission gate rejected the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Wrapped storage-layer failure.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            pointer: None,
        }
    }

    pub fn invalid_at(message: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            pointer: Some(pointer.into()),
        }
    }

    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }

    /// Whether the transaction coordinator should replay the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SerializationConflict)
    }
}
