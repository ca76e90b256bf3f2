mod error;
mod playlist;
mod stderr;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TranscodeSection;
use crate::planner::{Quality, RenditionSpec};

pub use error::{TranscodeError, TranscodeResult};
pub use playlist::{MediaPlaylist, MediaSegment};
pub use stderr::StderrTail;

pub const PLAYLIST_NAME: &str = "playlist.m3u8";
pub const SEGMENT_TEMPLATE: &str = "segment_%03d.ts";

/// Files produced for one rendition inside its scratch directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionOutput {
    pub label: Quality,
    pub dir: PathBuf,
    pub playlist: PathBuf,
    pub segments: Vec<PathBuf>,
    pub avg_segment_seconds: f64,
}

impl RenditionOutput {
    pub fn segment_count(&self) -> u32 {
        u32::try_from(self.segments.len()).unwrap_or(u32::MAX)
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encodes one rendition of `input` into `output_dir` as an HLS playlist.
    async fn transcode(
        &self,
        input: &str,
        spec: &RenditionSpec,
        output_dir: &Path,
        cancel: CancellationToken,
    ) -> TranscodeResult<RenditionOutput>;

    /// Extracts a single JPEG frame at `offset_s`.
    async fn thumbnail(
        &self,
        input: &str,
        offset_s: f64,
        output: &Path,
        cancel: CancellationToken,
    ) -> TranscodeResult<()>;
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub ffmpeg_path: PathBuf,
    pub segment_seconds: u32,
    pub timeout: Duration,
    pub max_stderr_bytes: usize,
    pub transient_exit_codes: BTreeSet<i32>,
    pub cancel_grace: Duration,
    pub preset: String,
}

impl From<&TranscodeSection> for DriverSettings {
    fn from(section: &TranscodeSection) -> Self {
        Self {
            ffmpeg_path: section.ffmpeg_path.clone(),
            segment_seconds: section.segment_seconds,
            timeout: section.timeout(),
            max_stderr_bytes: section.max_stderr_bytes,
            transient_exit_codes: section.transient_exit_codes.clone(),
            cancel_grace: section.cancel_grace(),
            preset: section.preset.clone(),
        }
    }
}

enum ChildOutcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

struct ChildRun {
    outcome: ChildOutcome,
    stderr: StderrTail,
}

/// Runs `ffmpeg` as a child process per rendition.
#[derive(Debug, Clone)]
pub struct FfmpegDriver {
    settings: DriverSettings,
}

impl FfmpegDriver {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(section: &TranscodeSection) -> Self {
        Self::new(DriverSettings::from(section))
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn rendition_args(&self, input: &str, spec: &RenditionSpec, output_dir: &Path) -> Vec<String> {
        let scale = format!(
            "scale={}:{}:force_original_aspect_ratio=decrease:force_divisible_by=2",
            spec.box_width, spec.box_height
        );
        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostdin",
            "-y",
            "-i",
            input,
            "-map",
            "0:v:0",
            "-map",
            "0:a:0?",
            "-vf",
            scale.as_str(),
            "-r",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        args.extend([
            spec.fps.to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-profile:v".into(),
            "high".into(),
            "-preset".into(),
            self.settings.preset.clone(),
            "-b:v".into(),
            spec.video_bitrate_bps.to_string(),
            "-maxrate".into(),
            spec.video_bitrate_bps.to_string(),
            "-bufsize".into(),
            spec.buffer_size_bps.to_string(),
            "-g".into(),
            spec.gop.to_string(),
            "-keyint_min".into(),
            spec.gop.to_string(),
            "-sc_threshold".into(),
            "0".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            spec.audio_bitrate_bps.to_string(),
            "-ac".into(),
            "2".into(),
            "-ar".into(),
            "48000".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            self.settings.segment_seconds.to_string(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_flags".into(),
            "independent_segments".into(),
            "-hls_segment_filename".into(),
            output_dir.join(SEGMENT_TEMPLATE).to_string_lossy().to_string(),
            output_dir.join(PLAYLIST_NAME).to_string_lossy().to_string(),
        ]);
        args
    }

    pub fn thumbnail_args(input: &str, offset_s: f64, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-ss".into(),
            format!("{:.3}", offset_s.max(0.0)),
            "-i".into(),
            input.to_string(),
            "-frames:v".into(),
            "1".into(),
            "-q:v".into(),
            "2".into(),
            output.to_string_lossy().to_string(),
        ]
    }

    async fn run_child(&self, args: &[String], cancel: &CancellationToken) -> std::io::Result<ChildRun> {
        debug!(program = %self.settings.ffmpeg_path.display(), args = ?args, "spawning encoder");
        let mut command = Command::new(&self.settings.ffmpeg_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let capacity = self.settings.max_stderr_bytes;
        let stderr = child.stderr.take();
        let reader = tokio::spawn(async move {
            let mut tail = StderrTail::new(capacity);
            if let Some(mut pipe) = stderr {
                let mut buf = vec![0u8; 8 * 1024];
                loop {
                    match pipe.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => tail.push(&buf[..read]),
                    }
                }
            }
            tail
        });

        let outcome = tokio::select! {
            status = child.wait() => ChildOutcome::Exited(status),
            _ = sleep(self.settings.timeout) => ChildOutcome::TimedOut,
            _ = cancel.cancelled() => ChildOutcome::Cancelled,
        };
        if !matches!(outcome, ChildOutcome::Exited(_)) {
            self.terminate(&mut child).await;
        }

        let mut reader = reader;
        let stderr = match timeout(self.settings.cancel_grace, &mut reader).await {
            Ok(Ok(tail)) => tail,
            Ok(Err(err)) => {
                warn!(error = %err, "stderr reader task failed");
                StderrTail::default()
            }
            Err(_) => {
                // A grandchild still holds the pipe open.
                reader.abort();
                StderrTail::default()
            }
        };
        Ok(ChildRun { outcome, stderr })
    }

    async fn terminate(&self, child: &mut Child) {
        if let Err(err) = child.start_kill() {
            debug!(error = %err, "encoder already exited");
        }
        match timeout(self.settings.cancel_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(status = %status, "encoder reaped"),
            Ok(Err(err)) => warn!(error = %err, "failed to reap encoder"),
            Err(_) => warn!(grace = ?self.settings.cancel_grace, "encoder not reaped within grace window"),
        }
    }

    fn is_transient_exit(&self, status: &ExitStatus) -> bool {
        exit_code(status)
            .map(|code| self.settings.transient_exit_codes.contains(&code))
            .unwrap_or(false)
    }

    async fn discard_dir(dir: &Path) {
        if let Err(err) = fs::remove_dir_all(dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %err, "failed to remove rendition scratch");
            }
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegDriver {
    async fn transcode(
        &self,
        input: &str,
        spec: &RenditionSpec,
        output_dir: &Path,
        cancel: CancellationToken,
    ) -> TranscodeResult<RenditionOutput> {
        let label = spec.label;
        let failed = |reason: String, transient: bool, stderr_tail: String| TranscodeError::Failed {
            label,
            reason,
            transient,
            stderr_tail,
        };

        // Leftovers from an earlier attempt must not satisfy verification.
        Self::discard_dir(output_dir).await;
        fs::create_dir_all(output_dir).await.map_err(|err| {
            failed(
                format!("cannot create {}: {err}", output_dir.display()),
                true,
                String::new(),
            )
        })?;

        let args = self.rendition_args(input, spec, output_dir);
        let run = match self.run_child(&args, &cancel).await {
            Ok(run) => run,
            Err(err) => {
                Self::discard_dir(output_dir).await;
                return Err(failed(format!("failed to spawn encoder: {err}"), true, String::new()));
            }
        };
        let stderr_tail = run.stderr.to_string_lossy();

        let error = match run.outcome {
            ChildOutcome::Cancelled => TranscodeError::Cancelled { label },
            ChildOutcome::TimedOut => failed(
                format!("timed out after {:?}", self.settings.timeout),
                false,
                stderr_tail,
            ),
            ChildOutcome::Exited(Err(err)) => {
                failed(format!("failed waiting for encoder: {err}"), true, stderr_tail)
            }
            ChildOutcome::Exited(Ok(status)) if !status.success() => failed(
                format!("encoder exited with {}", describe_status(&status)),
                self.is_transient_exit(&status),
                stderr_tail,
            ),
            ChildOutcome::Exited(Ok(_)) => {
                match MediaPlaylist::verify(output_dir, PLAYLIST_NAME).await {
                    Ok(playlist) => {
                        return Ok(RenditionOutput {
                            label,
                            dir: output_dir.to_path_buf(),
                            playlist: output_dir.join(PLAYLIST_NAME),
                            segments: playlist
                                .segments
                                .iter()
                                .map(|segment| output_dir.join(&segment.uri))
                                .collect(),
                            avg_segment_seconds: playlist.average_segment_seconds(),
                        })
                    }
                    Err(reason) => failed(reason, false, stderr_tail),
                }
            }
        };
        Self::discard_dir(output_dir).await;
        Err(error)
    }

    async fn thumbnail(
        &self,
        input: &str,
        offset_s: f64,
        output: &Path,
        cancel: CancellationToken,
    ) -> TranscodeResult<()> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| TranscodeError::Thumbnail {
                    reason: format!("cannot create {}: {err}", parent.display()),
                })?;
        }
        let args = Self::thumbnail_args(input, offset_s, output);
        let run = self
            .run_child(&args, &cancel)
            .await
            .map_err(|err| TranscodeError::Thumbnail {
                reason: format!("failed to spawn encoder: {err}"),
            })?;
        let reason = match run.outcome {
            ChildOutcome::Exited(Ok(status)) if status.success() => {
                match fs::metadata(output).await {
                    Ok(metadata) if metadata.len() > 0 => return Ok(()),
                    _ => "encoder produced no frame".to_string(),
                }
            }
            ChildOutcome::Exited(Ok(status)) => {
                format!("encoder exited with {}", describe_status(&status))
            }
            ChildOutcome::Exited(Err(err)) => format!("failed waiting for encoder: {err}"),
            ChildOutcome::TimedOut => format!("timed out after {:?}", self.settings.timeout),
            ChildOutcome::Cancelled => "cancelled".to_string(),
        };
        let _ = fs::remove_file(output).await;
        Err(TranscodeError::Thumbnail { reason })
    }
}

/// Exit code, with signal deaths reported shell-style as 128 + signal.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    None
}

fn describe_status(status: &ExitStatus) -> String {
    match exit_code(status) {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}
