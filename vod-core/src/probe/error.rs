use thiserror::Error;

use crate::asset::ErrorKind;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("source {source_handle} unreadable: {reason}")]
    SourceUnreadable {
        source_handle: String,
        reason: String,
    },
    #[error("source has no video stream")]
    NoVideoStream,
    #[error("unsupported container: {container}")]
    UnsupportedContainer { container: String },
    #[error("source duration {duration_s:.1}s exceeds maximum of {max_s}s")]
    DurationExceedsMax { duration_s: f64, max_s: u64 },
}

impl ProbeError {
    pub(crate) fn unreadable(handle: &str, reason: impl Into<String>) -> Self {
        ProbeError::SourceUnreadable {
            source_handle: handle.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::SourceUnreadable { .. } => ErrorKind::SourceUnreadable,
            ProbeError::NoVideoStream => ErrorKind::NoVideoStream,
            ProbeError::UnsupportedContainer { .. } => ErrorKind::UnsupportedContainer,
            ProbeError::DurationExceedsMax { .. } => ErrorKind::DurationExceedsMax,
        }
    }
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;
