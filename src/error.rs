//! Error taxonomy for the collector core.
//!
//! Synchronous operations (ingest, resolve) propagate these errors to their
//! caller. Asynchronous paths (evaluation, alert emission) catch everything
//! at the point they were scheduled and degrade to logging.

/// Errors surfaced by public core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input to a public operation.
    #[error("invalid request: {0}")]
    Validation(String),
    /// The referenced issue does not exist.
    #[error("issue not found: {0}")]
    NotFound(String),
    /// The issue was already resolved. Distinct from retryable conflicts.
    #[error("issue is already resolved")]
    AlreadyResolved,
    /// Optimistic-concurrency retries were exhausted. The caller may
    /// resubmit the whole operation.
    #[error("concurrent modification, retries exhausted; please try again")]
    Conflict,
    /// The underlying store failed.
    #[error("storage failure: {0}")]
    Persistence(String),
}

/// Errors raised by the store contracts.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A version-checked write was rejected because the stored version
    /// changed since the read.
    #[error("version conflict")]
    VersionConflict,
    /// An insert violated the one-OPEN-issue-per-key constraint.
    #[error("unique key violation")]
    UniqueKeyViolation,
    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            // Retry loops handle these two before converting; if one escapes
            // to the caller it is a retryable conflict.
            StoreError::VersionConflict | StoreError::UniqueKeyViolation => Error::Conflict,
            StoreError::Backend(msg) => Error::Persistence(msg),
        }
    }
}
