use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vod_core::asset::AssetView;
use vod_core::orchestrator::{JobOutcome, JobReport};
use vod_core::{
    load_pipeline_config, CreateOutcome, ErrorKind, IngestService, LocalObjectStore,
    Orchestrator, PipelineConfig, Quality, ServiceError, SqliteAssetStore, Worker,
    WorkerSettings,
};

const DEFAULT_CONFIG: &str = "configs/pipeline.toml";

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vod_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0}")]
    Store(#[from] vod_core::StoreError),
    #[error("{0}")]
    Service(#[from] ServiceError),
    #[error("{0}")]
    Pipeline(#[from] vod_core::PipelineError),
    #[error("storage error: {0}")]
    Storage(#[from] vod_core::StorageError),
    #[error("invalid ladder: {0}")]
    InvalidLadder(String),
    #[error("health check failed: {0}")]
    Unhealthy(String),
}

impl AppError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::InvalidLadder(_) => 3,
            AppError::Service(err) if err.is_validation() => 3,
            AppError::Service(err) => kind_exit_code(err.kind()),
            AppError::Store(err) => kind_exit_code(Some(err.kind())),
            _ => 1,
        }
    }
}

fn kind_exit_code(kind: Option<ErrorKind>) -> i32 {
    match kind {
        Some(ErrorKind::AssetAlreadyExists) => 2,
        Some(ErrorKind::UnknownAsset) => 4,
        Some(ErrorKind::AssetBusy) => 5,
        _ => 1,
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "VOD ingestion pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to pipeline.toml; built-in defaults apply when omitted and absent
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Override for the asset database path
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queues a source for ingestion
    Submit(SubmitArgs),
    /// Shows the current state of an asset
    Status(AssetArgs),
    /// Requests cancellation of an in-flight asset
    Cancel(AssetArgs),
    /// Removes a finished asset and its published files
    Delete(AssetArgs),
    /// Runs the job worker
    Worker(WorkerArgs),
    /// Checks configuration, database, tools and directories
    Health,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[arg(long)]
    pub asset_id: String,
    /// Local path, file:// or http(s) URL
    #[arg(long)]
    pub source: String,
    /// Comma-separated labels, e.g. 360p,720p
    #[arg(long)]
    pub ladder: Option<String>,
}

#[derive(Args, Debug)]
pub struct AssetArgs {
    #[arg(long)]
    pub asset_id: String,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Claim and run at most one job, then exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Worker identity used for leases
    #[arg(long)]
    pub worker_id: Option<String>,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Submit(args) => {
            let report = context.submit(args)?;
            render(&report, cli.format)?;
        }
        Commands::Status(args) => {
            let view = context.status(&args.asset_id)?;
            render(&view, cli.format)?;
        }
        Commands::Cancel(args) => {
            let view = context.cancel(&args.asset_id).await?;
            render(&view, cli.format)?;
        }
        Commands::Delete(args) => {
            let view = context.delete(&args.asset_id).await?;
            render(&view, cli.format)?;
        }
        Commands::Worker(args) => {
            let report = context.worker(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::Unhealthy(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

pub fn parse_ladder(raw: &str) -> Result<Vec<Quality>> {
    let ladder = Quality::parse_list(raw).map_err(AppError::InvalidLadder)?;
    if ladder.is_empty() {
        return Err(AppError::InvalidLadder("no labels given".to_string()));
    }
    Ok(ladder)
}

#[derive(Debug)]
struct AppContext {
    config: PipelineConfig,
    config_path: Option<PathBuf>,
    database: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let (config, config_path) = match &cli.config {
            Some(path) => (load_pipeline_config(path)?, Some(path.clone())),
            None if Path::new(DEFAULT_CONFIG).exists() => (
                load_pipeline_config(DEFAULT_CONFIG)?,
                Some(PathBuf::from(DEFAULT_CONFIG)),
            ),
            None => (PipelineConfig::default(), None),
        };
        let database = cli
            .database
            .clone()
            .unwrap_or_else(|| config.database_path());
        Ok(Self {
            config,
            config_path,
            database,
        })
    }

    fn open_store(&self) -> Result<SqliteAssetStore> {
        let store = SqliteAssetStore::builder()
            .path(&self.database)
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    fn service(&self) -> Result<IngestService> {
        let objects =
            LocalObjectStore::from_config(self.config.storage_root(), &self.config.storage)?;
        Ok(IngestService::new(
            self.open_store()?,
            Arc::new(objects),
            self.config.ladder.default.clone(),
        ))
    }

    fn submit(&self, args: &SubmitArgs) -> Result<SubmitReport> {
        let ladder = args.ladder.as_deref().map(parse_ladder).transpose()?;
        let outcome = self.service()?.submit(&args.asset_id, &args.source, ladder)?;
        let created = matches!(outcome, CreateOutcome::Created(_));
        let asset = outcome.into_asset();
        Ok(SubmitReport {
            asset_id: asset.asset_id,
            status: asset.status.to_string(),
            created,
        })
    }

    fn status(&self, asset_id: &str) -> Result<AssetView> {
        Ok(self.service()?.get_status(asset_id)?)
    }

    async fn cancel(&self, asset_id: &str) -> Result<AssetView> {
        Ok(self.service()?.cancel(asset_id).await?)
    }

    async fn delete(&self, asset_id: &str) -> Result<AssetView> {
        Ok(self.service()?.delete(asset_id).await?)
    }

    async fn worker(&self, args: &WorkerArgs) -> Result<WorkerReport> {
        let orchestrator = Orchestrator::from_config(&self.config, self.open_store()?)?;
        let mut settings = WorkerSettings::from_config(&self.config);
        if let Some(worker_id) = &args.worker_id {
            settings = settings.with_worker_id(worker_id.clone());
        }
        let worker = Worker::new(orchestrator, settings);

        let jobs = if args.once {
            worker.tick().await?.into_iter().collect()
        } else {
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    trigger.cancel();
                }
            });
            worker.run_loop(shutdown).await?
        };
        Ok(WorkerReport {
            worker_id: worker.id().to_string(),
            jobs: jobs.iter().map(JobEntry::from).collect(),
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(match &self.config_path {
            Some(path) => self.check_path("pipeline.toml", path),
            None => HealthEntry::warn("pipeline.toml", "not found; using built-in defaults"),
        });
        results.push(self.check_database("assets.sqlite", &self.database));
        results.push(self.check_tool("ffprobe", &self.config.probe.ffprobe_path));
        results.push(self.check_tool("ffmpeg", &self.config.transcode.ffmpeg_path));
        results.push(self.check_directory("scratch_root", &self.config.scratch_root()));
        results.push(self.check_directory("storage_root", &self.config.storage_root()));
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::error(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(
                name,
                format!("{path} not found; created on first use", path = path.display()),
            ),
        }
    }

    fn check_tool(&self, name: &str, binary: &Path) -> HealthEntry {
        let status = Command::new(binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => HealthEntry::ok(name, format!("{}", binary.display())),
            Ok(status) => HealthEntry::error(
                name,
                format!("{} -version exited with {status}", binary.display()),
            ),
            Err(err) => HealthEntry::error(name, format!("{}: {err}", binary.display())),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(
                name,
                format!("{path} not found; created on first use", path = path.display()),
            );
        }
        let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => conn,
            Err(err) => return HealthEntry::error(name, format!("open failed: {err}")),
        };
        let pragma: rusqlite::Result<String> =
            conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
        match pragma {
            Ok(result) if result.eq_ignore_ascii_case("ok") => {}
            Ok(result) => return HealthEntry::warn(name, format!("integrity_check: {result}")),
            Err(err) => return HealthEntry::error(name, format!("integrity_check failed: {err}")),
        }
        let counts = SqliteAssetStore::builder()
            .path(path)
            .read_only(true)
            .build()
            .and_then(|store| store.count_by_status());
        match counts {
            Ok(counts) if counts.is_empty() => HealthEntry::ok(name, "integrity ok; no assets"),
            Ok(counts) => {
                let summary = counts
                    .iter()
                    .map(|(status, count)| format!("{status}={count}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                HealthEntry::ok(name, format!("integrity ok; {summary}"))
            }
            Err(err) => HealthEntry::warn(name, format!("status counts unavailable: {err}")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitReport {
    pub asset_id: String,
    pub status: String,
    /// False when an identical queued submission already existed.
    pub created: bool,
}

impl DisplayFallback for SubmitReport {
    fn display(&self) -> String {
        if self.created {
            format!("{} accepted ({})", self.asset_id, self.status)
        } else {
            format!("{} already queued ({})", self.asset_id, self.status)
        }
    }
}

impl DisplayFallback for AssetView {
    fn display(&self) -> String {
        let mut lines = vec![format!("{} [{}]", self.asset_id, self.status)];
        lines.push(format!("  source: {}", self.source_handle));
        lines.push(format!("  updated: {}", self.updated_at.to_rfc3339()));
        if let Some(kind) = &self.error_kind {
            lines.push(format!(
                "  error: {kind}: {}",
                self.error_detail.as_deref().unwrap_or("-")
            ));
        }
        for rendition in &self.renditions {
            let segments = rendition
                .segment_count
                .map(|count| format!("{count} segments"))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  - {} {} {} attempt={} bandwidth={} {}",
                rendition.label,
                rendition.status,
                rendition.resolution,
                rendition.attempt,
                rendition.bandwidth,
                segments
            ));
        }
        if let Some(playback) = &self.playback {
            lines.push(format!("  master: {}", playback.master_url));
            if let Some(thumb) = &playback.thumbnail_url {
                lines.push(format!("  thumbnail: {thumb}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct WorkerReport {
    pub worker_id: String,
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Serialize)]
pub struct JobEntry {
    pub asset_id: String,
    pub job_id: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&JobReport> for JobEntry {
    fn from(report: &JobReport) -> Self {
        let (outcome, detail) = match &report.outcome {
            JobOutcome::Ready => ("ready", None),
            JobOutcome::Failed(kind) => ("failed", Some(kind.to_string())),
            JobOutcome::Cancelled => ("cancelled", None),
            JobOutcome::Abandoned(reason) => ("abandoned", Some(reason.clone())),
        };
        Self {
            asset_id: report.asset_id.clone(),
            job_id: report.job_id.clone(),
            outcome: outcome.to_string(),
            detail,
        }
    }
}

impl DisplayFallback for WorkerReport {
    fn display(&self) -> String {
        if self.jobs.is_empty() {
            return format!("{}: no job claimed", self.worker_id);
        }
        let mut lines = vec![format!("{}:", self.worker_id)];
        for job in &self.jobs {
            lines.push(format!(
                "  - {} {}{}",
                job.asset_id,
                job.outcome,
                job.detail
                    .as_deref()
                    .map(|detail| format!(" ({detail})"))
                    .unwrap_or_default()
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vod_core::AssetStatus;

    fn prepare_test_context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let mut config = PipelineConfig::default();
        config.storage.base_dir = temp.path().to_path_buf();
        let database = temp.path().join("data/assets.sqlite");
        let context = AppContext {
            config,
            config_path: None,
            database,
        };
        (temp, context)
    }

    fn submit_args(asset_id: &str, ladder: Option<&str>) -> SubmitArgs {
        SubmitArgs {
            asset_id: asset_id.to_string(),
            source: "/media/source.mp4".to_string(),
            ladder: ladder.map(str::to_string),
        }
    }

    #[test]
    fn submit_then_status_reports_queued() {
        let (_temp, context) = prepare_test_context();
        let report = context.submit(&submit_args("a1", Some("720p,360p"))).unwrap();
        assert!(report.created);
        assert_eq!(report.status, "QUEUED");

        let view = context.status("a1").unwrap();
        assert_eq!(view.status, AssetStatus::Queued);
        assert!(view.playback.is_none());

        let again = context.submit(&submit_args("a1", Some("720p,360p"))).unwrap();
        assert!(!again.created);
    }

    #[test]
    fn exit_codes_follow_error_kinds() {
        let (_temp, context) = prepare_test_context();
        context.submit(&submit_args("a1", None)).unwrap();

        let mut other = submit_args("a1", None);
        other.source = "/media/other.mp4".to_string();
        assert_eq!(context.submit(&other).unwrap_err().exit_code(), 2);
        assert_eq!(context.submit(&submit_args("bad id", None)).unwrap_err().exit_code(), 3);
        assert_eq!(
            context.submit(&submit_args("a2", Some("999p"))).unwrap_err().exit_code(),
            3
        );
        assert_eq!(context.status("missing").unwrap_err().exit_code(), 4);
    }

    #[tokio::test]
    async fn delete_requires_terminal_status() {
        let (_temp, context) = prepare_test_context();
        context.submit(&submit_args("a1", None)).unwrap();
        assert_eq!(context.delete("a1").await.unwrap_err().exit_code(), 5);

        let view = context.cancel("a1").await.unwrap();
        assert_eq!(view.status, AssetStatus::Cancelled);
        context.delete("a1").await.unwrap();
        assert_eq!(context.status("a1").unwrap_err().exit_code(), 4);
    }

    #[test]
    fn health_flags_missing_tools() {
        let (_temp, mut context) = prepare_test_context();
        context.config.probe.ffprobe_path = PathBuf::from("/nonexistent/ffprobe");
        let report = context.health_check();
        let probe = report.iter().find(|entry| entry.name == "ffprobe").unwrap();
        assert!(matches!(probe.status, CheckStatus::Error));
        let config = report.iter().find(|entry| entry.name == "pipeline.toml").unwrap();
        assert!(matches!(config.status, CheckStatus::Warn));
    }

    #[test]
    fn parse_ladder_rejects_unknown_labels() {
        assert_eq!(
            parse_ladder("360p, 1080p").unwrap(),
            vec![Quality::P360, Quality::P1080]
        );
        assert!(matches!(parse_ladder("4k"), Err(AppError::InvalidLadder(_))));
    }
}
