use thiserror::Error;

use crate::asset::ErrorKind;
use crate::planner::Quality;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("rendition {label} failed: {reason}")]
    Failed {
        label: Quality,
        reason: String,
        transient: bool,
        stderr_tail: String,
    },
    #[error("rendition {label} cancelled")]
    Cancelled { label: Quality },
    #[error("thumbnail failed: {reason}")]
    Thumbnail { reason: String },
}

impl TranscodeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TranscodeError::Failed { transient: true, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TranscodeError::Cancelled { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::EncoderTransient
        } else {
            ErrorKind::TranscodeFailed
        }
    }

    /// Reason followed by the captured encoder stderr, if any.
    pub fn detail(&self) -> String {
        match self {
            TranscodeError::Failed {
                reason,
                stderr_tail,
                ..
            } if !stderr_tail.trim().is_empty() => format!("{reason}\n{}", stderr_tail.trim_end()),
            other => other.to_string(),
        }
    }
}

pub type TranscodeResult<T> = std::result::Result<T, TranscodeError>;
