//! Error types for the generations crate

use thiserror::Error;

/// Result type for generation-manager operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating generations
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying object-store failure
    #[error(transparent)]
    Store(#[from] shardlog_core::Error),

    /// The observed metadata failed multi-party consistency validation
    #[error("inconsistency: {0}")]
    Inconsistency(String),

    /// The caller asked for something the state machine forbids
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The metadata body failed to decode
    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Create an inconsistency error
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::Inconsistency(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Whether this is a CAS miss that mutator retry loops absorb.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Store(shardlog_core::Error::Canceled(_)))
    }
}
