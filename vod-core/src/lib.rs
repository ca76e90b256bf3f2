pub mod asset;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod probe;
pub mod publish;
pub mod retry;
pub mod service;
pub mod sqlite;
pub mod storage;
pub mod transcode;

pub use asset::{
    Asset, AssetStatus, AssetView, ClaimedJob, CreateOutcome, ErrorKind, Rendition,
    RenditionStatus, SqliteAssetStore, SqliteAssetStoreBuilder, StoreError, StoreResult,
};
pub use config::{load_pipeline_config, PipelineConfig};
pub use error::{ConfigError, Result};
pub use orchestrator::{
    JobOutcome, JobReport, Orchestrator, OrchestratorSettings, PipelineError, PipelineResult,
    Worker, WorkerSettings,
};
pub use planner::{plan_renditions, LadderRequest, Quality, RenditionPlan, RenditionSpec};
pub use probe::{FfprobeProber, ProbeError, Prober, SourceDescriptor, SourceHandle};
pub use publish::{PublishError, Publisher};
pub use retry::RetryPolicy;
pub use service::{IngestService, ServiceError, ServiceResult};
pub use storage::{LocalObjectStore, ObjectStore, StorageError};
pub use transcode::{FfmpegDriver, TranscodeError, Transcoder};
