//! Error types for the stores and configuration.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::store::version::SchemaVersion;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("value of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("store is closed")]
    Closed,

    #[error("migration to {version} failed: {reason}")]
    Migration {
        version: SchemaVersion,
        reason: String,
    },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    /// Errors worth another attempt of the same logical write.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict(_) | StoreError::TooLarge { .. } => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::TooBig
            ),
            StoreError::Sled(sled::Error::Io(err)) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("marker {0:?} is configured as both positive and negative")]
    OverlappingMarker(String),
}
