use std::path::PathBuf;

use thiserror::Error;

use crate::asset::{ErrorKind, StoreError};
use crate::planner::PlanningError;
use crate::probe::ProbeError;
use crate::publish::PublishError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error("no rendition completed: {detail}")]
    RenditionsFailed { detail: String },
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("scratch error at {path}: {source}")]
    Scratch {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Probe(err) => err.kind(),
            PipelineError::Planning(_) => ErrorKind::NoEligibleRenditions,
            PipelineError::RenditionsFailed { .. } => ErrorKind::TranscodeFailed,
            PipelineError::Publish(err) => err.kind(),
            PipelineError::Store(err) => err.kind(),
            PipelineError::Storage(_) | PipelineError::Scratch { .. } | PipelineError::Cancelled => {
                ErrorKind::Internal
            }
        }
    }

    /// Another worker now owns the asset, so nothing may be written.
    pub fn is_ownership_loss(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(StoreError::LeaseLost { .. })
                | PipelineError::Store(StoreError::StatusConflict { .. })
        )
    }

    pub fn detail(&self) -> String {
        match self {
            PipelineError::RenditionsFailed { detail } => detail.clone(),
            other => other.to_string(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
