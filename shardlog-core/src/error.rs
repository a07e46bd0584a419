//! Error types for shardlog-core

use thiserror::Error;

/// Result type for object-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the object store and its client libraries
///
/// `Canceled` has specific semantics: it marks a failed version predicate
/// (CAS conflict) and is the one kind mutator retry loops are expected to
/// absorb. Everything else is generally fatal for the operation.
#[derive(Error, Debug)]
pub enum Error {
    /// Object does not exist
    #[error("no such object: {0}")]
    NotFound(String),

    /// Exclusive creation lost a race
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// A version predicate failed (CAS conflict)
    #[error("canceled: {0}")]
    Canceled(String),

    /// A reply budget ran out
    #[error("timed out: {0}")]
    Timeout(String),

    /// I/O or transport error
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an already exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a canceled (CAS conflict) error
    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::Canceled(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}
