use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::planner::Quality;
use crate::probe::Container;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PipelineConfig {
    pub probe: ProbeSection,
    pub transcode: TranscodeSection,
    pub ladder: LadderSection,
    pub lease: LeaseSection,
    pub storage: StorageSection,
    pub worker: WorkerSection,
    pub database: DatabaseSection,
}

impl PipelineConfig {
    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.ladder.default.is_empty() {
            return Err(ConfigError::Invalid(
                "ladder.default must name at least one quality".into(),
            ));
        }
        if self.lease.renew_s == 0 || self.lease.renew_s >= self.lease.ttl_s {
            return Err(ConfigError::Invalid(format!(
                "lease.renew_s ({}) must be positive and below lease.ttl_s ({})",
                self.lease.renew_s, self.lease.ttl_s
            )));
        }
        if self.transcode.segment_seconds == 0 {
            return Err(ConfigError::Invalid(
                "transcode.segment_seconds must be positive".into(),
            ));
        }
        if self.transcode.retry_base_s > self.transcode.retry_cap_s {
            return Err(ConfigError::Invalid(
                "transcode.retry_base_s must not exceed transcode.retry_cap_s".into(),
            ));
        }
        if self.probe.supported_containers.is_empty() {
            return Err(ConfigError::Invalid(
                "probe.supported_containers must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.storage.base_dir.join(path)
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.resolve_path(&self.storage.scratch_root)
    }

    pub fn storage_root(&self) -> PathBuf {
        self.resolve_path(&self.storage.storage_root)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.database.path)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub ffprobe_path: PathBuf,
    pub max_source_duration_s: u64,
    pub supported_containers: BTreeSet<Container>,
    pub timeout_s: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            ffprobe_path: PathBuf::from("ffprobe"),
            max_source_duration_s: 21_600,
            supported_containers: Container::ALL.iter().copied().collect(),
            timeout_s: 60,
        }
    }
}

impl ProbeSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub ffmpeg_path: PathBuf,
    pub segment_seconds: u32,
    pub timeout_s: u64,
    pub max_stderr_bytes: usize,
    pub max_rendition_retries: u32,
    pub transient_exit_codes: BTreeSet<i32>,
    pub retry_base_s: u64,
    pub retry_cap_s: u64,
    /// `None` means one slot per CPU core.
    pub worker_pool_size: Option<usize>,
    pub cancel_grace_s: u64,
    pub preset: String,
    pub thumbnail: bool,
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            segment_seconds: 6,
            timeout_s: 3_600,
            max_stderr_bytes: 10 * 1024 * 1024,
            max_rendition_retries: 2,
            // 69 = EX_UNAVAILABLE, 75 = EX_TEMPFAIL, 137 = killed by the OOM reaper
            transient_exit_codes: [69, 75, 137].into_iter().collect(),
            retry_base_s: 5,
            retry_cap_s: 60,
            worker_pool_size: None,
            cancel_grace_s: 10,
            preset: "veryfast".to_string(),
            thumbnail: true,
        }
    }
}

impl TranscodeSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_s)
    }

    pub fn pool_size(&self) -> usize {
        self.worker_pool_size
            .filter(|size| *size > 0)
            .unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LadderSection {
    pub default: Vec<Quality>,
}

impl Default for LadderSection {
    fn default() -> Self {
        Self {
            default: vec![Quality::P360, Quality::P480, Quality::P720, Quality::P1080],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseSection {
    pub ttl_s: u64,
    pub renew_s: u64,
    pub cancel_poll_ms: u64,
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_s: 300,
            renew_s: 60,
            cancel_poll_ms: 1_000,
        }
    }
}

impl LeaseSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_s)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_s)
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub base_dir: PathBuf,
    pub scratch_root: PathBuf,
    pub storage_root: PathBuf,
    /// Prefix for playback URLs; when unset, URLs are `file://` paths.
    pub public_base_url: Option<String>,
    pub upload_timeout_s: u64,
    pub upload_retries: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            scratch_root: PathBuf::from("scratch"),
            storage_root: PathBuf::from("storage"),
            public_base_url: None,
            upload_timeout_s: 300,
            upload_retries: 2,
        }
    }
}

impl StorageSection {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub max_active_jobs: usize,
    pub idle_poll_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            max_active_jobs: 2,
            idle_poll_ms: 2_000,
        }
    }
}

impl WorkerSection {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/assets.sqlite"),
        }
    }
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let config: PipelineConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/pipeline.toml");
        let config = load_pipeline_config(path).expect("config should parse");
        assert_eq!(config.probe.max_source_duration_s, 21_600);
        assert_eq!(config.transcode.segment_seconds, 6);
        assert_eq!(config.lease.ttl_s, 300);
        assert_eq!(
            config.ladder.default,
            vec![Quality::P360, Quality::P480, Quality::P720, Quality::P1080]
        );
        assert!(config.probe.supported_containers.contains(&Container::Mkv));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: PipelineConfig = toml::from_str(
            "[transcode]\nmax_rendition_retries = 4\nworker_pool_size = 3\n",
        )
        .unwrap();
        assert_eq!(config.transcode.max_rendition_retries, 4);
        assert_eq!(config.transcode.pool_size(), 3);
        assert_eq!(config.transcode.timeout_s, 3_600);
        assert_eq!(config.storage.upload_timeout_s, 300);
        config.validate().unwrap();
    }

    #[test]
    fn renew_interval_must_be_below_ttl() {
        let mut config = PipelineConfig::default();
        config.lease.renew_s = config.lease.ttl_s;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_quality_is_rejected() {
        let result: std::result::Result<PipelineConfig, _> =
            toml::from_str("[ladder]\ndefault = [\"999p\"]\n");
        assert!(result.is_err());
    }
}
