mod error;
mod types;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ProbeSection;

pub use error::{ProbeError, ProbeResult};
pub use types::{
    AudioStream, Container, SourceDescriptor, SourceHandle, SourceLocation, VideoStream,
};

const STDERR_IN_ERROR: usize = 512;

/// Acceptance limits applied after introspection.
#[derive(Debug, Clone)]
pub struct ProbeLimits {
    pub max_source_duration_s: u64,
    pub supported_containers: BTreeSet<Container>,
}

impl From<&ProbeSection> for ProbeLimits {
    fn from(section: &ProbeSection) -> Self {
        Self {
            max_source_duration_s: section.max_source_duration_s,
            supported_containers: section.supported_containers.clone(),
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, source: &SourceHandle) -> ProbeResult<SourceDescriptor>;
}

/// Introspects sources by running `ffprobe` and normalizing its JSON report.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary: PathBuf,
    timeout: Duration,
    limits: ProbeLimits,
}

impl FfprobeProber {
    pub fn new(section: &ProbeSection) -> Self {
        Self {
            binary: section.ffprobe_path.clone(),
            timeout: section.timeout(),
            limits: ProbeLimits::from(section),
        }
    }

    pub fn limits(&self) -> &ProbeLimits {
        &self.limits
    }

    fn command_args(input: &str) -> Vec<String> {
        [
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            input,
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, source: &SourceHandle) -> ProbeResult<SourceDescriptor> {
        let location = source.resolve()?;
        let mut local_size = None;
        if let SourceLocation::Local(path) = &location {
            let metadata = tokio::fs::metadata(path).await.map_err(|err| {
                ProbeError::unreadable(source.as_str(), format!("{}: {err}", path.display()))
            })?;
            if !metadata.is_file() {
                return Err(ProbeError::unreadable(source.as_str(), "not a regular file"));
            }
            local_size = Some(metadata.len());
        }

        let args = Self::command_args(&location.as_input());
        debug!(program = %self.binary.display(), args = ?args, "running ffprobe");
        let mut command = Command::new(&self.binary);
        command
            .kill_on_drop(true)
            .args(&args)
            .stdin(Stdio::null());

        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(ProbeError::unreadable(
                    source.as_str(),
                    format!("failed to run ffprobe: {err}"),
                ))
            }
            Err(_) => {
                return Err(ProbeError::unreadable(
                    source.as_str(),
                    format!("ffprobe timed out after {:?}", self.timeout),
                ))
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr_tail(stderr.trim(), STDERR_IN_ERROR);
            return Err(ProbeError::unreadable(
                source.as_str(),
                format!("ffprobe exited with {}: {tail}", output.status),
            ));
        }

        let report = FfprobeReport::parse(&output.stdout)
            .map_err(|reason| ProbeError::unreadable(source.as_str(), reason))?;
        describe(
            &report,
            location.extension().as_deref(),
            local_size,
            &self.limits,
            source.as_str(),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FfprobeReport {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

impl FfprobeReport {
    pub(crate) fn parse(json: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(json).map_err(|err| format!("invalid ffprobe output: {err}"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    sample_rate: Option<String>,
    #[serde(default)]
    tags: Option<FfprobeTags>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
    #[serde(default)]
    disposition: Option<FfprobeDisposition>,
}

impl FfprobeStream {
    fn is_kind(&self, kind: &str) -> bool {
        self.codec_type.as_deref() == Some(kind)
    }

    /// Cover art in audio files shows up as a single-frame video stream.
    fn is_attached_picture(&self) -> bool {
        self.disposition
            .as_ref()
            .map(|disposition| disposition.attached_pic == 1)
            .unwrap_or(false)
    }

    fn rotation_deg(&self) -> u16 {
        let from_tag = self
            .tags
            .as_ref()
            .and_then(|tags| tags.rotate.as_deref())
            .and_then(|value| value.trim().parse::<f64>().ok());
        if let Some(degrees) = from_tag {
            return normalize_rotation(degrees);
        }
        // The display matrix reports counter-clockwise rotation.
        self.side_data_list
            .iter()
            .find_map(|side| side.rotation)
            .map(|degrees| normalize_rotation(-degrees))
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    #[serde(default)]
    rotate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeSideData {
    #[serde(default)]
    rotation: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

/// Turns a raw report into a descriptor. Checks run in a fixed order:
/// video stream, container, then duration.
pub(crate) fn describe(
    report: &FfprobeReport,
    extension: Option<&str>,
    local_size: Option<u64>,
    limits: &ProbeLimits,
    handle: &str,
) -> ProbeResult<SourceDescriptor> {
    let video_stream = report
        .streams
        .iter()
        .find(|stream| stream.is_kind("video") && !stream.is_attached_picture())
        .ok_or(ProbeError::NoVideoStream)?;
    let video_codec = video_stream.codec_name.clone().unwrap_or_default();

    let format_name = report.format.format_name.clone().unwrap_or_default();
    let container = Container::detect(&format_name, extension, &video_codec)
        .filter(|container| limits.supported_containers.contains(container))
        .ok_or_else(|| ProbeError::UnsupportedContainer {
            container: if format_name.is_empty() {
                "unknown".to_string()
            } else {
                format_name.clone()
            },
        })?;

    let duration_s = report
        .format
        .duration
        .as_deref()
        .or(video_stream.duration.as_deref())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .ok_or_else(|| ProbeError::unreadable(handle, "source duration unavailable"))?;
    if duration_s > limits.max_source_duration_s as f64 {
        return Err(ProbeError::DurationExceedsMax {
            duration_s,
            max_s: limits.max_source_duration_s,
        });
    }

    let (width, height) = match (video_stream.width, video_stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => (width, height),
        _ => {
            return Err(ProbeError::unreadable(
                handle,
                "video stream missing dimensions",
            ))
        }
    };

    let fps = parse_rate(video_stream.r_frame_rate.as_deref())
        .filter(|fps| *fps > 0.0)
        .or_else(|| parse_rate(video_stream.avg_frame_rate.as_deref()))
        .unwrap_or(0.0);

    let video = VideoStream {
        codec: video_codec,
        width,
        height,
        fps,
        bitrate_bps: parse_u64(video_stream.bit_rate.as_deref()),
        rotation_deg: video_stream.rotation_deg(),
    };

    let audio = report
        .streams
        .iter()
        .find(|stream| stream.is_kind("audio"))
        .map(|stream| AudioStream {
            codec: stream.codec_name.clone().unwrap_or_default(),
            channels: stream.channels.unwrap_or(0),
            sample_rate_hz: parse_u64(stream.sample_rate.as_deref())
                .map(|rate| u32::try_from(rate).unwrap_or(u32::MAX))
                .unwrap_or(0),
            bitrate_bps: parse_u64(stream.bit_rate.as_deref()),
        });

    Ok(SourceDescriptor {
        container,
        duration_s,
        total_bytes: parse_u64(report.format.size.as_deref()).or(local_size),
        video,
        audio,
    })
}

/// Parses "num/den" or a plain number; a zero denominator yields the numerator.
pub fn parse_rate(rate: Option<&str>) -> Option<f64> {
    let rate = rate?.trim();
    if let Some((numerator, denominator)) = rate.split_once('/') {
        let numerator = numerator.trim().parse::<f64>().ok()?;
        let denominator = denominator.trim().parse::<f64>().ok()?;
        if denominator == 0.0 {
            return Some(numerator);
        }
        Some(numerator / denominator)
    } else {
        rate.parse::<f64>().ok()
    }
}

/// Snaps any angle to the nearest quarter turn in [0, 360).
pub fn normalize_rotation(degrees: f64) -> u16 {
    if !degrees.is_finite() {
        return 0;
    }
    let quarter_turns = (degrees / 90.0).round() as i64;
    (quarter_turns.rem_euclid(4) * 90) as u16
}

fn parse_u64(value: Option<&str>) -> Option<u64> {
    value.and_then(|raw| raw.trim().parse::<u64>().ok())
}

fn stderr_tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((index, _)) => &text[index..],
        None => text,
    }
}
