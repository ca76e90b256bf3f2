use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::probe::VideoStream;

pub const TARGET_FPS: u32 = 30;
/// Two seconds of frames; identical across rungs so segment boundaries align.
pub const GOP_FRAMES: u32 = TARGET_FPS * 2;
pub const VIDEO_CODEC: &str = "h264";
pub const AUDIO_CODEC: &str = "aac";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("no requested quality fits a source of effective height {source_height}")]
    NoEligibleRenditions { source_height: u32 },
    #[error("requested ladder is empty")]
    EmptyLadder,
}

pub type PlanningResult<T> = std::result::Result<T, PlanningError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quality {
    P240,
    P360,
    P480,
    P720,
    P1080,
    P1440,
    P2160,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityTarget {
    pub width: u32,
    pub height: u32,
    pub video_kbps: u64,
    pub audio_kbps: u64,
    pub buffer_kbps: u64,
}

impl Quality {
    pub const ALL: [Quality; 7] = [
        Quality::P240,
        Quality::P360,
        Quality::P480,
        Quality::P720,
        Quality::P1080,
        Quality::P1440,
        Quality::P2160,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Quality::P240 => "240p",
            Quality::P360 => "360p",
            Quality::P480 => "480p",
            Quality::P720 => "720p",
            Quality::P1080 => "1080p",
            Quality::P1440 => "1440p",
            Quality::P2160 => "2160p",
        }
    }

    pub fn target(&self) -> QualityTarget {
        let (width, height, video_kbps, audio_kbps, buffer_kbps) = match self {
            Quality::P240 => (426, 240, 400, 64, 600),
            Quality::P360 => (640, 360, 600, 64, 900),
            Quality::P480 => (854, 480, 1_000, 96, 1_500),
            Quality::P720 => (1_280, 720, 2_500, 128, 3_750),
            Quality::P1080 => (1_920, 1_080, 5_000, 192, 7_500),
            Quality::P1440 => (2_560, 1_440, 8_000, 192, 12_000),
            Quality::P2160 => (3_840, 2_160, 14_000, 192, 21_000),
        };
        QualityTarget {
            width,
            height,
            video_kbps,
            audio_kbps,
            buffer_kbps,
        }
    }

    /// A rung is eligible when the source is at least 80% of its height.
    pub fn fits_source_height(&self, effective_height: u32) -> bool {
        u64::from(effective_height) * 5 >= u64::from(self.target().height) * 4
    }

    pub fn parse_list(raw: &str) -> Result<Vec<Quality>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(Quality::from_str)
            .collect()
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Quality::ALL
            .iter()
            .copied()
            .find(|quality| quality.label().eq_ignore_ascii_case(needle))
            .ok_or_else(|| format!("unknown quality label: {needle}"))
    }
}

impl Serialize for Quality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Requested ladder plus whether the caller named it or the default applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderRequest {
    pub qualities: Vec<Quality>,
    pub explicit: bool,
}

impl LadderRequest {
    pub fn explicit(qualities: Vec<Quality>) -> Self {
        Self {
            qualities,
            explicit: true,
        }
    }

    pub fn default_ladder(qualities: Vec<Quality>) -> Self {
        Self {
            qualities,
            explicit: false,
        }
    }

    /// Unique labels in ascending bitrate order.
    pub fn normalized(&self) -> Vec<Quality> {
        self.qualities
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Encoding parameters for one rung.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenditionSpec {
    pub label: Quality,
    /// Scale box handed to the encoder; never larger than the source.
    pub box_width: u32,
    pub box_height: u32,
    /// Aspect-preserving fit inside the box.
    pub width: u32,
    pub height: u32,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub buffer_size_bps: u64,
    pub fps: u32,
    pub gop: u32,
    pub codec_v: String,
    pub codec_a: String,
}

impl RenditionSpec {
    /// Target video+audio bitrate plus 10% overhead, rounded half up.
    pub fn bandwidth(&self) -> u64 {
        ((self.video_bitrate_bps + self.audio_bitrate_bps) * 11 + 5) / 10
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenditionPlan {
    pub renditions: Vec<RenditionSpec>,
    /// Explicitly requested rungs that the source cannot feed.
    pub skipped: Vec<Quality>,
}

pub fn plan_renditions(
    video: &VideoStream,
    request: &LadderRequest,
) -> PlanningResult<RenditionPlan> {
    let qualities = request.normalized();
    if qualities.is_empty() {
        return Err(PlanningError::EmptyLadder);
    }
    let (source_width, source_height) = video.effective_dimensions();

    let mut renditions = Vec::new();
    let mut skipped = Vec::new();
    for quality in qualities {
        if quality.fits_source_height(source_height) {
            renditions.push(build_spec(quality, source_width, source_height));
        } else if request.explicit {
            skipped.push(quality);
        }
    }

    if renditions.is_empty() {
        return Err(PlanningError::NoEligibleRenditions { source_height });
    }
    renditions.sort_by_key(|spec| spec.video_bitrate_bps);
    Ok(RenditionPlan {
        renditions,
        skipped,
    })
}

fn build_spec(quality: Quality, source_width: u32, source_height: u32) -> RenditionSpec {
    let target = quality.target();
    let box_width = target.width.min(source_width.max(2));
    let box_height = target.height.min(source_height.max(2));
    let (width, height) = fit_within(source_width, source_height, box_width, box_height);
    RenditionSpec {
        label: quality,
        box_width,
        box_height,
        width,
        height,
        video_bitrate_bps: target.video_kbps * 1_000,
        audio_bitrate_bps: target.audio_kbps * 1_000,
        buffer_size_bps: target.buffer_kbps * 1_000,
        fps: TARGET_FPS,
        gop: GOP_FRAMES,
        codec_v: VIDEO_CODEC.to_string(),
        codec_a: AUDIO_CODEC.to_string(),
    }
}

/// Largest even-sized frame with the source aspect ratio that fits the box.
fn fit_within(source_width: u32, source_height: u32, box_width: u32, box_height: u32) -> (u32, u32) {
    if source_width == 0 || source_height == 0 {
        return (even_floor(box_width), even_floor(box_height));
    }
    let (sw, sh) = (u64::from(source_width), u64::from(source_height));
    let (bw, bh) = (u64::from(box_width), u64::from(box_height));
    // Compare bw/sw against bh/sh without floating point.
    let (width, height) = if bw * sh <= bh * sw {
        (bw, bw * sh / sw)
    } else {
        (bh * sw / sh, bh)
    };
    (even_floor(width as u32), even_floor(height as u32))
}

fn even_floor(value: u32) -> u32 {
    (value & !1).max(2)
}
