//! Error types for the snapshotter.
//!
//! Variants fall into a small set of abstract kinds that callers dispatch
//! on: `AlreadyExists` is the skip-fetch sentinel and is treated as success
//! by image pullers; `NotFound` drives idempotent removal; the remaining
//! kinds surface to the caller after any compensation has run.

use snapstore::StoreError;

/// Result type alias for snapshotter operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the snapshotter and its component drivers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The layer already exists, or is fully materializable without a data
    /// transfer. Callers treat this as success.
    #[error("already exists")]
    AlreadyExists,

    /// The named snapshot or label does not exist.
    #[error("{0}: not found")]
    NotFound(String),

    /// The caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The host or store is in a state that forbids the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A bounded polling loop ran out of attempts.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// An internal failure: sysfs writes, child process exits, marshalling.
    #[error("{0}")]
    Internal(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying syscall failure.
    #[error("errno: {0}")]
    Errno(#[from] rustix::io::Errno),

    /// Descriptor marshalling or unmarshalling failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is the not-found kind (including the store's).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether the error is the already-exists sentinel.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Error {
        match err {
            StoreError::NotFound(key) => Error::NotFound(key),
            StoreError::AlreadyExists(_) => Error::AlreadyExists,
            StoreError::InvalidArgument(msg) => Error::InvalidArgument(msg),
            StoreError::FailedPrecondition(msg) => Error::FailedPrecondition(msg),
            StoreError::Database(err) => Error::Internal(format!("metadata store: {err}")),
        }
    }
}
