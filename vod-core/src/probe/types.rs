use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::ProbeError;

/// Source containers the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mov,
    Mkv,
    Webm,
    Avi,
    Wmv,
    Flv,
}

impl Container {
    pub const ALL: [Container; 7] = [
        Container::Mp4,
        Container::Mov,
        Container::Mkv,
        Container::Webm,
        Container::Avi,
        Container::Wmv,
        Container::Flv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mov => "mov",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
            Container::Avi => "avi",
            Container::Wmv => "wmv",
            Container::Flv => "flv",
        }
    }

    /// Maps an ffprobe `format_name` (a comma separated demuxer list) to a
    /// container. The extension disambiguates demuxers shared by several
    /// containers (mov/mp4, matroska/webm).
    pub fn detect(format_name: &str, extension: Option<&str>, video_codec: &str) -> Option<Self> {
        let extension = extension.map(|ext| ext.to_ascii_lowercase());
        let demuxers: Vec<&str> = format_name.split(',').map(str::trim).collect();
        let has = |name: &str| demuxers.iter().any(|demuxer| *demuxer == name);

        if has("mov") || has("mp4") {
            return Some(match extension.as_deref() {
                Some("mov") | Some("qt") => Container::Mov,
                _ => Container::Mp4,
            });
        }
        if has("matroska") || has("webm") {
            let webm_codec = matches!(video_codec, "vp8" | "vp9" | "av1");
            return Some(match extension.as_deref() {
                Some("webm") => Container::Webm,
                Some("mkv") => Container::Mkv,
                _ if webm_codec => Container::Webm,
                _ => Container::Mkv,
            });
        }
        if has("avi") {
            return Some(Container::Avi);
        }
        if has("asf") {
            return Some(Container::Wmv);
        }
        if has("flv") {
            return Some(Container::Flv);
        }
        None
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Container::ALL
            .iter()
            .copied()
            .find(|container| container.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown container: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub bitrate_bps: Option<u64>,
    pub rotation_deg: u16,
}

impl VideoStream {
    /// Display-oriented dimensions, honoring rotation metadata.
    pub fn effective_dimensions(&self) -> (u32, u32) {
        if self.rotation_deg == 90 || self.rotation_deg == 270 {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    pub fn effective_height(&self) -> u32 {
        self.effective_dimensions().1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStream {
    pub codec: String,
    pub channels: u32,
    pub sample_rate_hz: u32,
    pub bitrate_bps: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub container: Container,
    pub duration_s: f64,
    pub total_bytes: Option<u64>,
    pub video: VideoStream,
    pub audio: Option<AudioStream>,
}

impl SourceDescriptor {
    /// Frame offset used for the poster image: ten seconds in, or the midpoint
    /// of shorter sources.
    pub fn thumbnail_offset_s(&self) -> f64 {
        (self.duration_s / 2.0).min(10.0).max(0.0)
    }
}

/// Where the source bytes live once a handle has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Local(PathBuf),
    Remote(Url),
}

impl SourceLocation {
    /// Argument handed to ffprobe/ffmpeg `-i`.
    pub fn as_input(&self) -> String {
        match self {
            SourceLocation::Local(path) => path.to_string_lossy().to_string(),
            SourceLocation::Remote(url) => url.to_string(),
        }
    }

    pub fn extension(&self) -> Option<String> {
        let path = match self {
            SourceLocation::Local(path) => path.clone(),
            SourceLocation::Remote(url) => PathBuf::from(url.path()),
        };
        path.extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }
}

/// Opaque URI naming the source bytes: a local path, a `file://` URL or a
/// signed `http(s)://` object URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceHandle(String);

impl SourceHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resolve(&self) -> Result<SourceLocation, ProbeError> {
        let raw = self.0.trim();
        if raw.is_empty() {
            return Err(ProbeError::unreadable(&self.0, "empty source handle"));
        }
        match Url::parse(raw) {
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| ProbeError::unreadable(&self.0, "invalid file url"))?;
                Ok(SourceLocation::Local(path))
            }
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(SourceLocation::Remote(url)),
            // Windows drive letters parse as one-letter schemes.
            Ok(url) if url.scheme().len() > 1 => Err(ProbeError::unreadable(
                &self.0,
                format!("unsupported scheme {}", url.scheme()),
            )),
            _ => Ok(SourceLocation::Local(PathBuf::from(raw))),
        }
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceHandle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
