//! # Error taxonomy
//!
//! Every fallible operation in the crate returns [`Result`], whose error type is
//! [`MemoryError`]. The variants map directly onto the failure classes callers care
//! about:
//!
//! - [`MemoryError::DimensionMismatch`]: an embedding does not have the index's length.
//!   Raised before anything is written.
//! - [`MemoryError::StorageFault`]: the SQLite record store failed. The write must not be
//!   assumed to have happened.
//! - [`MemoryError::SnapshotCorrupt`]: the on-disk vector index / id mapping pair is
//!   unusable (one file missing, checksum or count mismatch, undecodable bytes).
//!
//! The remaining variants cover configuration, snapshot I/O and invariant guards.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Failure raised by the relational store engine.
#[derive(Debug, Error)]
pub enum StorageFault {
    /// A query, insert or delete failed.
    #[error(transparent)]
    Query(#[from] diesel::result::Error),
    /// The database file could not be opened.
    #[error(transparent)]
    Connection(#[from] diesel::ConnectionError),
}

/// Errors returned by the memory backend and its components.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Embedding length differs from the index dimension.
    #[error("dimension mismatch: index expects {expected} values, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The record store failed.
    #[error("storage fault: {0}")]
    StorageFault(#[from] StorageFault),

    /// The snapshot pair on disk cannot be trusted.
    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    /// A snapshot could not be encoded.
    #[error("snapshot encode failed: {0}")]
    SnapshotEncode(#[from] bincode::error::EncodeError),

    /// Filesystem error while reading or writing snapshot files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An owner or session identifier was empty.
    #[error("{0} must not be empty")]
    EmptyIdentifier(&'static str),

    /// An id mapping insert would leave a gap or reuse a position.
    #[error("id mapping out of order: next position is {expected}, got {actual}")]
    MappingOutOfOrder { expected: usize, actual: usize },

    /// Configuration values are unusable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Configuration file is not valid YAML for [`crate::config::BackendConfig`].
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A thread panicked while holding the index lock.
    #[error("vector index lock poisoned")]
    LockPoisoned,
}

impl From<diesel::result::Error> for MemoryError {
    fn from(err: diesel::result::Error) -> Self {
        MemoryError::StorageFault(StorageFault::Query(err))
    }
}

impl From<diesel::ConnectionError> for MemoryError {
    fn from(err: diesel::ConnectionError) -> Self {
        MemoryError::StorageFault(StorageFault::Connection(err))
    }
}

impl From<bincode::error::DecodeError> for MemoryError {
    fn from(err: bincode::error::DecodeError) -> Self {
        MemoryError::SnapshotCorrupt(err.to_string())
    }
}
