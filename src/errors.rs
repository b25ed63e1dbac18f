use std::io;

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Error taxonomy of the storage engine.
///
/// All variants except [`StorageError::Io`] represent programming or
/// data-integrity violations and are raised immediately to the caller;
/// there is no retry logic at this layer. Transient I/O failures (lock
/// contention, disk errors) propagate as [`StorageError::Io`] and the
/// caller owns the retry policy.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid database-id '{0}' (does not match the database-id grammar)")]
    InvalidId(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cannot remove or modify meta-database '{0}'")]
    Forbidden(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
}
