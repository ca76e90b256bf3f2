use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::planner::{LadderRequest, Quality, RenditionSpec};
use crate::probe::{SourceDescriptor, SourceHandle};

/// Bound applied to user-visible failure text.
pub const MAX_ERROR_DETAIL_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    Queued,
    Probing,
    Planned,
    Transcoding,
    Publishing,
    Ready,
    Failed,
    Cancelled,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Queued => "QUEUED",
            AssetStatus::Probing => "PROBING",
            AssetStatus::Planned => "PLANNED",
            AssetStatus::Transcoding => "TRANSCODING",
            AssetStatus::Publishing => "PUBLISHING",
            AssetStatus::Ready => "READY",
            AssetStatus::Failed => "FAILED",
            AssetStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssetStatus::Ready | AssetStatus::Failed | AssetStatus::Cancelled
        )
    }

    /// Forward pipeline edges plus the failure and cancel exits available from
    /// every non-terminal state.
    pub fn can_transition_to(&self, next: AssetStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (AssetStatus::Queued, AssetStatus::Probing)
                | (AssetStatus::Probing, AssetStatus::Planned)
                | (AssetStatus::Planned, AssetStatus::Transcoding)
                | (AssetStatus::Transcoding, AssetStatus::Publishing)
                | (AssetStatus::Publishing, AssetStatus::Ready)
                | (_, AssetStatus::Failed)
                | (_, AssetStatus::Cancelled)
        )
    }

    /// Position along the happy path; used to skip stages already committed.
    pub fn stage_rank(&self) -> u8 {
        match self {
            AssetStatus::Queued => 0,
            AssetStatus::Probing => 1,
            AssetStatus::Planned => 2,
            AssetStatus::Transcoding => 3,
            AssetStatus::Publishing => 4,
            AssetStatus::Ready => 5,
            AssetStatus::Failed | AssetStatus::Cancelled => 6,
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(AssetStatus::Queued),
            "PROBING" => Ok(AssetStatus::Probing),
            "PLANNED" => Ok(AssetStatus::Planned),
            "TRANSCODING" => Ok(AssetStatus::Transcoding),
            "PUBLISHING" => Ok(AssetStatus::Publishing),
            "READY" => Ok(AssetStatus::Ready),
            "FAILED" => Ok(AssetStatus::Failed),
            "CANCELLED" => Ok(AssetStatus::Cancelled),
            other => Err(format!("unknown asset status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenditionStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl RenditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionStatus::Pending => "PENDING",
            RenditionStatus::Running => "RUNNING",
            RenditionStatus::Done => "DONE",
            RenditionStatus::Failed => "FAILED",
            RenditionStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RenditionStatus::Done | RenditionStatus::Failed | RenditionStatus::Skipped
        )
    }
}

impl fmt::Display for RenditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable failure identifiers exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceUnreadable,
    UnsupportedContainer,
    DurationExceedsMax,
    NoVideoStream,
    NoEligibleRenditions,
    EncoderTransient,
    UploadTransient,
    StateStoreTransient,
    TranscodeFailed,
    PublishFailed,
    AssetAlreadyExists,
    AssetBusy,
    UnknownAsset,
    /// Local faults outside the taxonomy (scratch I/O, corrupt records).
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 14] = [
        ErrorKind::SourceUnreadable,
        ErrorKind::UnsupportedContainer,
        ErrorKind::DurationExceedsMax,
        ErrorKind::NoVideoStream,
        ErrorKind::NoEligibleRenditions,
        ErrorKind::EncoderTransient,
        ErrorKind::UploadTransient,
        ErrorKind::StateStoreTransient,
        ErrorKind::TranscodeFailed,
        ErrorKind::PublishFailed,
        ErrorKind::AssetAlreadyExists,
        ErrorKind::AssetBusy,
        ErrorKind::UnknownAsset,
        ErrorKind::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnreadable => "SourceUnreadable",
            ErrorKind::UnsupportedContainer => "UnsupportedContainer",
            ErrorKind::DurationExceedsMax => "DurationExceedsMax",
            ErrorKind::NoVideoStream => "NoVideoStream",
            ErrorKind::NoEligibleRenditions => "NoEligibleRenditions",
            ErrorKind::EncoderTransient => "EncoderTransient",
            ErrorKind::UploadTransient => "UploadTransient",
            ErrorKind::StateStoreTransient => "StateStoreTransient",
            ErrorKind::TranscodeFailed => "TranscodeFailed",
            ErrorKind::PublishFailed => "PublishFailed",
            ErrorKind::AssetAlreadyExists => "AssetAlreadyExists",
            ErrorKind::AssetBusy => "AssetBusy",
            ErrorKind::UnknownAsset => "UnknownAsset",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Problems with the submitted source; never retried.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceUnreadable
                | ErrorKind::UnsupportedContainer
                | ErrorKind::DurationExceedsMax
                | ErrorKind::NoVideoStream
                | ErrorKind::NoEligibleRenditions
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::EncoderTransient | ErrorKind::UploadTransient | ErrorKind::StateStoreTransient
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown error kind: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rendition {
    pub label: Quality,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub buffer_size_bps: u64,
    pub bandwidth: u64,
    pub codec_v: String,
    pub codec_a: String,
    pub status: RenditionStatus,
    pub attempt: u32,
    #[serde(default)]
    pub playlist_url: Option<String>,
    #[serde(default)]
    pub segment_count: Option<u32>,
    #[serde(default)]
    pub avg_segment_seconds: Option<f64>,
    #[serde(default)]
    pub failure: Option<String>,
}

impl Rendition {
    pub fn pending(spec: &RenditionSpec) -> Self {
        Self {
            label: spec.label,
            width: spec.width,
            height: spec.height,
            video_bitrate_bps: spec.video_bitrate_bps,
            audio_bitrate_bps: spec.audio_bitrate_bps,
            buffer_size_bps: spec.buffer_size_bps,
            bandwidth: spec.bandwidth(),
            codec_v: spec.codec_v.clone(),
            codec_a: spec.codec_a.clone(),
            status: RenditionStatus::Pending,
            attempt: 0,
            playlist_url: None,
            segment_count: None,
            avg_segment_seconds: None,
            failure: None,
        }
    }

    /// Placeholder for an explicitly requested rung the source cannot feed.
    pub fn skipped(label: Quality, source_height: u32) -> Self {
        let target = label.target();
        Self {
            label,
            width: target.width,
            height: target.height,
            video_bitrate_bps: target.video_kbps * 1_000,
            audio_bitrate_bps: target.audio_kbps * 1_000,
            buffer_size_bps: target.buffer_kbps * 1_000,
            bandwidth: 0,
            codec_v: crate::planner::VIDEO_CODEC.to_string(),
            codec_a: crate::planner::AUDIO_CODEC.to_string(),
            status: RenditionStatus::Skipped,
            attempt: 0,
            playlist_url: None,
            segment_count: None,
            avg_segment_seconds: None,
            failure: Some(format!(
                "source height {source_height} below 80% of {}",
                target.height
            )),
        }
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub source_handle: SourceHandle,
    pub ladder: LadderRequest,
    pub fingerprint: String,
    pub status: AssetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub probe: Option<SourceDescriptor>,
    pub renditions: Vec<Rendition>,
    pub master_manifest_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl Asset {
    pub fn new(asset_id: impl Into<String>, source_handle: SourceHandle, ladder: LadderRequest) -> Self {
        let now = Utc::now();
        let fingerprint = Self::fingerprint_of(&source_handle, &ladder);
        Self {
            asset_id: asset_id.into(),
            source_handle,
            ladder,
            fingerprint,
            status: AssetStatus::Queued,
            created_at: now,
            updated_at: now,
            error_kind: None,
            error_detail: None,
            probe: None,
            renditions: Vec::new(),
            master_manifest_url: None,
            thumbnail_url: None,
        }
    }

    /// Hex SHA-256 over the source handle and the normalized ladder labels.
    pub fn fingerprint_of(source_handle: &SourceHandle, ladder: &LadderRequest) -> String {
        let labels: Vec<&str> = ladder
            .normalized()
            .iter()
            .map(|quality| quality.label())
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(source_handle.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(labels.join(",").as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn rendition_mut(&mut self, label: Quality) -> Option<&mut Rendition> {
        self.renditions
            .iter_mut()
            .find(|rendition| rendition.label == label)
    }

    pub fn done_renditions(&self) -> impl Iterator<Item = &Rendition> {
        self.renditions
            .iter()
            .filter(|rendition| rendition.status == RenditionStatus::Done)
    }

    pub fn record_failure(&mut self, kind: ErrorKind, detail: impl AsRef<str>) {
        self.error_kind = Some(kind);
        self.error_detail = Some(bounded_detail(detail.as_ref(), MAX_ERROR_DETAIL_BYTES));
        self.master_manifest_url = None;
        self.thumbnail_url = None;
    }

    pub fn view(&self) -> AssetView {
        AssetView::from(self)
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let error_kind: Option<String> = row.get("error_kind")?;
        let ladder: String = row.get("ladder")?;
        let probe: Option<String> = row.get("probe")?;
        let renditions: String = row.get("renditions")?;
        Ok(Self {
            asset_id: row.get("asset_id")?,
            source_handle: SourceHandle::new(row.get::<_, String>("source_handle")?),
            ladder: LadderRequest {
                qualities: json_column(&ladder, "ladder")?,
                explicit: row.get::<_, i64>("ladder_explicit")? != 0,
            },
            fingerprint: row.get("fingerprint")?,
            status: status
                .parse()
                .map_err(|err: String| conversion_error("status", err))?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            error_kind: error_kind
                .map(|value| value.parse())
                .transpose()
                .map_err(|err: String| conversion_error("error_kind", err))?,
            error_detail: row.get("error_detail")?,
            probe: probe
                .map(|value| json_column(&value, "probe"))
                .transpose()?,
            renditions: json_column(&renditions, "renditions")?,
            master_manifest_url: row.get("master_manifest_url")?,
            thumbnail_url: row.get("thumbnail_url")?,
        })
    }
}

fn json_column<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| conversion_error(column, err.to_string()))
}

fn conversion_error(column: &str, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("column {column}: {message}").into(),
    )
}

/// Keeps the last `max_bytes` of `text`, cutting on a character boundary.
pub fn bounded_detail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub asset_id: String,
    /// Names the scratch directory of the current attempt.
    pub job_id: String,
    pub worker_id: Option<String>,
    pub lease_expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn lease_live(&self, now: DateTime<Utc>) -> bool {
        self.worker_id.is_some() && self.lease_expires_at > now
    }

    pub fn held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.worker_id.as_deref() == Some(worker_id) && self.lease_expires_at > now
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let lease_ms: i64 = row.get("lease_expires_at")?;
        Ok(Self {
            asset_id: row.get("asset_id")?,
            job_id: row.get("job_id")?,
            worker_id: row.get("worker_id")?,
            lease_expires_at: from_epoch_millis(lease_ms),
            attempts: u32::try_from(row.get::<_, i64>("attempts")?.max(0)).unwrap_or(u32::MAX),
            cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
            created_at: row.get("created_at")?,
        })
    }
}

pub(crate) fn from_epoch_millis(value: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(value)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A committed status change, as recorded in the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Option<AssetStatus>,
    pub to: AssetStatus,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Caller-facing snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetView {
    pub asset_id: String,
    pub status: AssetStatus,
    pub source_handle: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_detail: Option<String>,
    pub renditions: Vec<RenditionView>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub playback: Option<PlaybackView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenditionView {
    pub label: Quality,
    pub status: RenditionStatus,
    pub attempt: u32,
    pub resolution: String,
    pub bandwidth: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub segment_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub avg_segment_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackView {
    pub master_url: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thumbnail_url: Option<String>,
    pub renditions: BTreeMap<String, String>,
}

impl From<&Asset> for AssetView {
    fn from(asset: &Asset) -> Self {
        let playback = match (&asset.status, &asset.master_manifest_url) {
            (AssetStatus::Ready, Some(master_url)) => Some(PlaybackView {
                master_url: master_url.clone(),
                thumbnail_url: asset.thumbnail_url.clone(),
                renditions: asset
                    .done_renditions()
                    .filter_map(|rendition| {
                        rendition
                            .playlist_url
                            .clone()
                            .map(|url| (rendition.label.label().to_string(), url))
                    })
                    .collect(),
            }),
            _ => None,
        };
        Self {
            asset_id: asset.asset_id.clone(),
            status: asset.status,
            source_handle: asset.source_handle.to_string(),
            created_at: asset.created_at,
            updated_at: asset.updated_at,
            error_kind: asset.error_kind,
            error_detail: asset.error_detail.clone(),
            renditions: asset
                .renditions
                .iter()
                .map(|rendition| RenditionView {
                    label: rendition.label,
                    status: rendition.status,
                    attempt: rendition.attempt,
                    resolution: rendition.resolution(),
                    bandwidth: rendition.bandwidth,
                    segment_count: rendition.segment_count,
                    avg_segment_seconds: rendition.avg_segment_seconds,
                    failure: rendition.failure.clone(),
                })
                .collect(),
            playback,
        }
    }
}
