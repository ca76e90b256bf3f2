use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use super::models::{AssetStatus, ErrorKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("asset store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("asset {asset_id} not found")]
    NotFound { asset_id: String },
    #[error("asset {asset_id} already exists with status {status}")]
    AlreadyExists {
        asset_id: String,
        status: AssetStatus,
    },
    #[error("asset {asset_id} is still {status}")]
    Busy {
        asset_id: String,
        status: AssetStatus,
    },
    #[error("asset {asset_id} cannot move from {from} to {to}")]
    InvalidTransition {
        asset_id: String,
        from: AssetStatus,
        to: AssetStatus,
    },
    #[error("asset {asset_id} expected in {expected} but found {actual}")]
    StatusConflict {
        asset_id: String,
        expected: AssetStatus,
        actual: AssetStatus,
    },
    #[error("asset {asset_id} record rejected: {reason}")]
    Rejected { asset_id: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("worker {worker_id} no longer holds the lease on {asset_id}")]
    LeaseLost { asset_id: String, worker_id: String },
}

impl StoreError {
    /// SQLite contention that is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(err) | StoreError::OpenDatabase { source: err, .. } => {
                is_busy(err)
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::UnknownAsset,
            StoreError::AlreadyExists { .. } => ErrorKind::AssetAlreadyExists,
            StoreError::Busy { .. } => ErrorKind::AssetBusy,
            _ if self.is_transient() => ErrorKind::StateStoreTransient,
            _ => ErrorKind::Internal,
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
