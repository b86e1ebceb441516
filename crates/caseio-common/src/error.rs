//! Error types for caseio
//!
//! Only `PathNotFound` is recoverable. Everything discovered after a file
//! has been opened, and every collective failure, is fatal for the
//! operation that hit it.

use crate::types::Rank;
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for caseio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for caseio
#[derive(Debug, Error)]
pub enum Error {
    // Resolution errors
    #[error("object not found: {path}")]
    PathNotFound { path: PathBuf },

    // Filesystem errors
    #[error("cannot open {path}: {source}")]
    OpenFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Object format errors
    #[error("header mismatch in {path}: expected class {expected}, found {found}")]
    HeaderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("malformed object {path}: {reason}")]
    MalformedObject { path: PathBuf, reason: String },

    #[error("corrupt block container: {0}")]
    CorruptContainer(String),

    // Collective errors
    #[error("collective desync on rank {rank} (peer {peer}): {reason}")]
    CollectiveDesync {
        rank: Rank,
        peer: Rank,
        reason: String,
    },

    #[error("operation failed on master rank {root}: {reason}")]
    RemoteFailure { root: Rank, reason: String },

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a not-found error for a composed path
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::PathNotFound { path: path.into() }
    }

    /// Create an open failure for a resolved path
    pub fn open_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::OpenFailure {
            path: path.into(),
            source,
        }
    }

    /// Create a malformed object error
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedObject {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a corrupt container error
    pub fn corrupt_container(reason: impl Into<String>) -> Self {
        Self::CorruptContainer(reason.into())
    }

    /// Create a collective desync error
    pub fn desync(rank: Rank, peer: Rank, reason: impl Into<String>) -> Self {
        Self::CollectiveDesync {
            rank,
            peer,
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the caller may apply a fallback strategy
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PathNotFound { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PathNotFound { .. })
    }

    /// Check if the error came out of a collective operation
    #[must_use]
    pub fn is_collective(&self) -> bool {
        matches!(
            self,
            Self::CollectiveDesync { .. } | Self::RemoteFailure { .. }
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
