use std::path::PathBuf;

use thiserror::Error;

use crate::oracle::OracleError;

pub type Result<T> = std::result::Result<T, MemoryBankError>;

#[derive(Debug, Error)]
pub enum MemoryBankError {
    /// Malformed config, metadata, or chunk log. Blocks writes to the store.
    #[error("corrupt storage at {path}: {detail}")]
    StorageCorrupt { path: PathBuf, detail: String },

    /// A structured transcript that yielded no usable records.
    #[error("malformed transcript {path}: {detail}")]
    TranscriptMalformed { path: PathBuf, detail: String },

    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// The index no longer reflects the chunk set; recoverable via rebuild.
    #[error("index is stale and must be rebuilt")]
    IndexStale,

    /// A vector insert did not match the index dimension; forces a rebuild.
    #[error("index dimension mismatch: expected {expected}, got {actual}")]
    IndexDimMismatch { expected: usize, actual: usize },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid token budget: {0}")]
    InvalidBudget(i64),

    #[error("invalid pack mode: {0}")]
    InvalidMode(String),

    #[error("store not initialized at {0} (run `mb init` first)")]
    NotInitialized(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MemoryBankError {
    /// Process exit code per the CLI contract: 2 when the oracle is
    /// unavailable, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            MemoryBankError::Oracle(
                OracleError::Unreachable(_) | OracleError::ModelMissing(_) | OracleError::Timeout,
            ) => 2,
            _ => 1,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, detail: impl std::fmt::Display) -> Self {
        MemoryBankError::StorageCorrupt {
            path: path.into(),
            detail: detail.to_string(),
        }
    }
}
