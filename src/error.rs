use thiserror::Error;

/// Errors surfaced by query execution. The driver reports the first error it
/// observes and cancels all in-flight workers; operators never retry.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("many-to-many matching not allowed: matching labels must be unique on one side")]
    ManyToMany,

    #[error("step misalignment: expected timestamp {expected}, got {got}")]
    StepMisalignment { expected: i64, got: i64 },

    #[error("unsupported expression: {0}")]
    UnsupportedExpr(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Cancellation is a distinguished kind so callers can avoid logging it
    /// as a failure.
    #[error("query canceled")]
    Canceled,
}

impl EngineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, EngineError::Canceled)
    }
}
