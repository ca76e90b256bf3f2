mod error;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::asset::{
    bounded_detail, Asset, AssetStatus, ClaimedJob, ErrorKind, Rendition, RenditionStatus,
    SqliteAssetStore, StoreError, MAX_ERROR_DETAIL_BYTES,
};
use crate::config::PipelineConfig;
use crate::planner::{plan_renditions, Quality, RenditionSpec};
use crate::probe::{FfprobeProber, Prober, SourceDescriptor};
use crate::publish::{PublishSettings, Publisher, ReadyRendition, THUMBNAIL_NAME};
use crate::retry::{retry_transient, RetryPolicy};
use crate::storage::LocalObjectStore;
use crate::transcode::{FfmpegDriver, RenditionOutput, TranscodeError, Transcoder};

pub use error::{PipelineError, PipelineResult};
pub use worker::{Worker, WorkerSettings};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub scratch_root: PathBuf,
    pub lease_ttl: Duration,
    pub lease_renew: Duration,
    pub cancel_poll: Duration,
    pub rendition_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
    pub thumbnail: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            scratch_root: config.scratch_root(),
            lease_ttl: config.lease.ttl(),
            lease_renew: config.lease.renew_interval(),
            cancel_poll: config.lease.cancel_poll(),
            rendition_retry: RetryPolicy::from(&config.transcode),
            store_retry: RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(5)),
            thumbnail: config.transcode.thumbnail,
        }
    }
}

/// How a claimed job ended for this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Ready,
    Failed(ErrorKind),
    Cancelled,
    /// Ownership was lost or the final write could not land; the job is left
    /// for another worker to take over.
    Abandoned(String),
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub asset_id: String,
    pub job_id: String,
    pub outcome: JobOutcome,
}

struct JobContext {
    asset: Asset,
    committed: AssetStatus,
    worker_id: String,
    scratch: PathBuf,
    cancel: CancellationToken,
    lease_lost: CancellationToken,
}

impl JobContext {
    fn check_cancel(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

enum RenditionEvent {
    Started {
        label: Quality,
        attempt: u32,
    },
    Finished {
        label: Quality,
        attempt: u32,
        result: Result<RenditionOutput, TranscodeError>,
    },
}

/// Drives one asset from QUEUED to a terminal status while holding its lease.
#[derive(Clone)]
pub struct Orchestrator {
    store: SqliteAssetStore,
    prober: Arc<dyn Prober>,
    transcoder: Arc<dyn Transcoder>,
    publisher: Publisher,
    pool: Arc<Semaphore>,
    settings: Arc<OrchestratorSettings>,
}

impl Orchestrator {
    pub fn new(
        store: SqliteAssetStore,
        prober: Arc<dyn Prober>,
        transcoder: Arc<dyn Transcoder>,
        publisher: Publisher,
        pool_size: usize,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            prober,
            transcoder,
            publisher,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            settings: Arc::new(settings),
        }
    }

    /// Wires ffprobe, ffmpeg and the local object store from configuration.
    pub fn from_config(config: &PipelineConfig, store: SqliteAssetStore) -> PipelineResult<Self> {
        let objects = LocalObjectStore::from_config(config.storage_root(), &config.storage)?;
        let publisher = Publisher::new(
            Arc::new(objects),
            PublishSettings {
                upload_timeout: config.storage.upload_timeout(),
                retry: RetryPolicy::from(&config.transcode)
                    .with_max_retries(config.storage.upload_retries),
            },
        );
        Ok(Self::new(
            store,
            Arc::new(FfprobeProber::new(&config.probe)),
            Arc::new(FfmpegDriver::from_config(&config.transcode)),
            publisher,
            config.transcode.pool_size(),
            OrchestratorSettings::from_config(config),
        ))
    }

    pub fn store(&self) -> &SqliteAssetStore {
        &self.store
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs a claimed job to completion. Scratch space is removed and the
    /// lease released on every exit path.
    pub async fn run_job(&self, claimed: ClaimedJob, worker_id: &str) -> JobReport {
        let asset_id = claimed.asset.asset_id.clone();
        let job_id = claimed.job.job_id.clone();

        if let Some(previous) = &claimed.previous_job_id {
            self.reconcile(&asset_id, previous).await;
        }

        let cancel = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        if claimed.job.cancel_requested {
            cancel.cancel();
        }
        let keeper = self.spawn_lease_keeper(
            asset_id.clone(),
            worker_id.to_string(),
            cancel.clone(),
            lease_lost.clone(),
        );

        let mut ctx = JobContext {
            committed: claimed.asset.status,
            asset: claimed.asset,
            worker_id: worker_id.to_string(),
            scratch: self.settings.scratch_root.join(&job_id),
            cancel,
            lease_lost,
        };
        info!(asset_id = %asset_id, job_id = %job_id, worker_id, status = %ctx.committed, "job started");

        let result = self.drive(&mut ctx).await;
        let outcome = self.settle(&mut ctx, result).await;

        keeper.abort();
        remove_dir(&ctx.scratch).await;
        if let Err(err) = self.store.release_async(&asset_id, worker_id).await {
            warn!(asset_id = %asset_id, error = %err, "failed to release lease");
        }
        info!(asset_id = %asset_id, job_id = %job_id, outcome = ?outcome, "job finished");
        JobReport {
            asset_id,
            job_id,
            outcome,
        }
    }

    async fn reconcile(&self, asset_id: &str, previous_job_id: &str) {
        if Uuid::parse_str(previous_job_id).is_ok() {
            remove_dir(&self.settings.scratch_root.join(previous_job_id)).await;
        }
        let removed = self.publisher.purge(asset_id).await;
        info!(asset_id, previous_job_id, removed, "reconciled abandoned attempt");
    }

    fn spawn_lease_keeper(
        &self,
        asset_id: String,
        worker_id: String,
        cancel: CancellationToken,
        lease_lost: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let ttl = self.settings.lease_ttl;
        let renew = self.settings.lease_renew;
        let poll = self.settings.cancel_poll;
        tokio::spawn(async move {
            let mut renew_tick = interval_at(Instant::now() + renew, renew);
            let mut poll_tick = interval_at(Instant::now() + poll, poll);
            loop {
                tokio::select! {
                    _ = renew_tick.tick() => match store.renew_lease_async(&asset_id, &worker_id, ttl).await {
                        Ok(deadline) => debug!(asset_id = %asset_id, %deadline, "lease renewed"),
                        Err(err) if err.is_transient() => {
                            warn!(asset_id = %asset_id, error = %err, "lease renewal deferred");
                        }
                        Err(err) => {
                            warn!(asset_id = %asset_id, error = %err, "lease lost; stopping job");
                            lease_lost.cancel();
                            cancel.cancel();
                            break;
                        }
                    },
                    _ = poll_tick.tick() => match store.is_cancel_requested_async(&asset_id).await {
                        Ok(true) if !cancel.is_cancelled() => {
                            info!(asset_id = %asset_id, "cancellation requested");
                            cancel.cancel();
                        }
                        Ok(_) => {}
                        Err(err) => debug!(asset_id = %asset_id, error = %err, "cancel poll failed"),
                    },
                }
            }
        })
    }

    async fn drive(&self, ctx: &mut JobContext) -> PipelineResult<()> {
        fs::create_dir_all(&ctx.scratch)
            .await
            .map_err(|source| PipelineError::Scratch {
                source,
                path: ctx.scratch.clone(),
            })?;
        ctx.check_cancel()?;

        self.advance(ctx, AssetStatus::Probing, Some("probing source"))
            .await?;
        let input = ctx.asset.source_handle.resolve()?.as_input();
        let descriptor = tokio::select! {
            result = self.prober.probe(&ctx.asset.source_handle) => result?,
            _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
        };
        info!(
            asset_id = %ctx.asset.asset_id,
            container = %descriptor.container,
            duration_s = descriptor.duration_s,
            width = descriptor.video.width,
            height = descriptor.video.height,
            "probed source"
        );
        ctx.asset.probe = Some(descriptor.clone());
        ctx.check_cancel()?;

        let plan = plan_renditions(&descriptor.video, &ctx.asset.ladder)?;
        let source_height = descriptor.video.effective_height();
        let mut renditions: Vec<Rendition> = plan.renditions.iter().map(Rendition::pending).collect();
        renditions.extend(
            plan.skipped
                .iter()
                .map(|quality| Rendition::skipped(*quality, source_height)),
        );
        renditions.sort_by_key(|rendition| rendition.label);
        ctx.asset.renditions = renditions;
        self.advance(ctx, AssetStatus::Planned, Some("renditions planned"))
            .await?;
        ctx.check_cancel()?;

        self.advance(ctx, AssetStatus::Transcoding, None).await?;
        let ready = self.transcode_all(ctx, &input, &plan.renditions).await?;
        let thumbnail = if self.settings.thumbnail {
            self.extract_thumbnail(ctx, &input, &descriptor).await
        } else {
            None
        };
        ctx.check_cancel()?;

        self.advance(ctx, AssetStatus::Publishing, None).await?;
        let asset_id = ctx.asset.asset_id.clone();
        let published = self
            .publisher
            .publish(&asset_id, &ready, thumbnail.as_deref(), &ctx.cancel)
            .await
            .map_err(|err| {
                if err.is_cancelled() {
                    PipelineError::Cancelled
                } else {
                    PipelineError::Publish(err)
                }
            })?;

        for entry in &published.renditions {
            if let Some(rendition) = ctx.asset.rendition_mut(entry.label) {
                rendition.playlist_url = Some(entry.playlist_url.clone());
                rendition.segment_count = Some(entry.segment_count);
            }
        }
        ctx.asset.master_manifest_url = Some(published.master_url.clone());
        ctx.asset.thumbnail_url = published.thumbnail_url.clone();

        ctx.check_cancel()?;
        self.commit(ctx, Some(AssetStatus::Ready), Some("published"))
            .await
    }

    async fn transcode_all(
        &self,
        ctx: &mut JobContext,
        input: &str,
        specs: &[RenditionSpec],
    ) -> PipelineResult<Vec<ReadyRendition>> {
        let (events, mut inbox) = mpsc::channel(specs.len().max(1) * 4);
        let abort = ctx.cancel.child_token();
        let mut tasks = JoinSet::new();
        for spec in specs {
            let task = RenditionTask {
                asset_id: ctx.asset.asset_id.clone(),
                transcoder: Arc::clone(&self.transcoder),
                pool: Arc::clone(&self.pool),
                input: input.to_string(),
                dir: ctx.scratch.join(spec.label.label()),
                spec: spec.clone(),
                policy: self.settings.rendition_retry,
                cancel: abort.clone(),
                events: events.clone(),
            };
            tasks.spawn(task.run());
        }
        drop(events);

        let mut outputs = Vec::new();
        let mut last_failure: Option<String> = None;
        let mut store_error: Option<PipelineError> = None;
        while let Some(event) = inbox.recv().await {
            match event {
                RenditionEvent::Started { label, attempt } => {
                    if let Some(rendition) = ctx.asset.rendition_mut(label) {
                        rendition.status = RenditionStatus::Running;
                        rendition.attempt = attempt;
                    }
                }
                RenditionEvent::Finished {
                    label,
                    attempt,
                    result,
                } => {
                    let Some(rendition) = ctx.asset.rendition_mut(label) else {
                        continue;
                    };
                    rendition.attempt = attempt;
                    match result {
                        Ok(output) => {
                            rendition.status = RenditionStatus::Done;
                            rendition.segment_count = Some(output.segment_count());
                            rendition.avg_segment_seconds = Some(output.avg_segment_seconds);
                            rendition.failure = None;
                            outputs.push(output);
                        }
                        Err(err) if err.is_cancelled() => continue,
                        Err(err) => {
                            let detail = err.detail();
                            rendition.status = RenditionStatus::Failed;
                            rendition.failure = Some(bounded_detail(&detail, MAX_ERROR_DETAIL_BYTES));
                            last_failure = Some(detail);
                        }
                    }
                }
            }
            if store_error.is_none() {
                if let Err(err) = self.commit(ctx, None, None).await {
                    warn!(asset_id = %ctx.asset.asset_id, error = %err, "rendition update failed; aborting");
                    abort.cancel();
                    store_error = Some(err);
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(asset_id = %ctx.asset.asset_id, error = %err, "rendition task aborted");
            }
        }

        if let Some(err) = store_error {
            return Err(err);
        }
        ctx.check_cancel()?;
        for rendition in ctx.asset.renditions.iter_mut() {
            if matches!(rendition.status, RenditionStatus::Pending | RenditionStatus::Running) {
                rendition.status = RenditionStatus::Failed;
                rendition.failure = Some("rendition task ended without a result".to_string());
            }
        }

        let mut ready = Vec::new();
        for output in outputs {
            if let Some(rendition) = ctx.asset.renditions.iter().find(|r| r.label == output.label) {
                ready.push(ReadyRendition {
                    rendition: rendition.clone(),
                    output,
                });
            }
        }
        if ready.is_empty() {
            return Err(PipelineError::RenditionsFailed {
                detail: last_failure.unwrap_or_else(|| "no rendition produced output".to_string()),
            });
        }
        ready.sort_by_key(|entry| entry.rendition.label);
        info!(
            asset_id = %ctx.asset.asset_id,
            done = ready.len(),
            planned = specs.len(),
            "transcoding finished"
        );
        Ok(ready)
    }

    async fn extract_thumbnail(
        &self,
        ctx: &JobContext,
        input: &str,
        descriptor: &SourceDescriptor,
    ) -> Option<PathBuf> {
        let output = ctx.scratch.join(THUMBNAIL_NAME);
        let _permit = tokio::select! {
            permit = Arc::clone(&self.pool).acquire_owned() => permit.ok()?,
            _ = ctx.cancel.cancelled() => return None,
        };
        match self
            .transcoder
            .thumbnail(input, descriptor.thumbnail_offset_s(), &output, ctx.cancel.clone())
            .await
        {
            Ok(()) => Some(output),
            Err(err) => {
                warn!(asset_id = %ctx.asset.asset_id, error = %err, "thumbnail extraction failed");
                None
            }
        }
    }

    /// Persists the working record, optionally moving to `next`. Stages
    /// already passed by an earlier attempt keep the stored status.
    async fn advance(
        &self,
        ctx: &mut JobContext,
        next: AssetStatus,
        note: Option<&str>,
    ) -> PipelineResult<()> {
        if ctx.committed.stage_rank() >= next.stage_rank() {
            return self.commit(ctx, None, None).await;
        }
        self.commit(ctx, Some(next), note).await
    }

    async fn commit(
        &self,
        ctx: &mut JobContext,
        next: Option<AssetStatus>,
        note: Option<&str>,
    ) -> PipelineResult<()> {
        let mut candidate = ctx.asset.clone();
        if let Some(status) = next {
            candidate.status = status;
        }
        let expected = ctx.committed;
        let store = &self.store;
        let candidate = &candidate;
        let worker_id = ctx.worker_id.as_str();
        let never = CancellationToken::new();
        let saved = retry_transient(
            &self.settings.store_retry,
            "state store",
            &never,
            StoreError::is_transient,
            move || store.save_async(candidate.clone(), expected, worker_id, note),
        )
        .await?;
        ctx.committed = saved.status;
        ctx.asset = saved;
        Ok(())
    }

    async fn clear_publication(&self, ctx: &mut JobContext) {
        ctx.asset.master_manifest_url = None;
        ctx.asset.thumbnail_url = None;
        for rendition in ctx.asset.renditions.iter_mut() {
            rendition.playlist_url = None;
        }
        self.publisher.purge(&ctx.asset.asset_id).await;
    }

    /// Records the terminal status for a failed or cancelled run. Storage is
    /// purged only after the lease is re-confirmed; without it the job is
    /// abandoned untouched.
    async fn settle(&self, ctx: &mut JobContext, result: PipelineResult<()>) -> JobOutcome {
        let err = match result {
            Ok(()) => return JobOutcome::Ready,
            Err(err) => err,
        };
        if ctx.lease_lost.is_cancelled() || err.is_ownership_loss() || !self.confirm_lease(ctx).await {
            warn!(asset_id = %ctx.asset.asset_id, error = %err, "ownership lost; abandoning job");
            return JobOutcome::Abandoned("lease lost".to_string());
        }
        if matches!(err, PipelineError::Cancelled) || ctx.cancel.is_cancelled() {
            debug!(asset_id = %ctx.asset.asset_id, error = %err, "stopping for cancellation");
            self.finish_cancelled(ctx).await
        } else {
            self.finish_failed(ctx, err).await
        }
    }

    /// Renews the lease once more; a full TTL then covers the cleanup writes.
    async fn confirm_lease(&self, ctx: &JobContext) -> bool {
        let store = &self.store;
        let asset_id = ctx.asset.asset_id.as_str();
        let worker_id = ctx.worker_id.as_str();
        let ttl = self.settings.lease_ttl;
        let never = CancellationToken::new();
        let renewed = retry_transient(
            &self.settings.store_retry,
            "lease check",
            &never,
            StoreError::is_transient,
            move || store.renew_lease_async(asset_id, worker_id, ttl),
        )
        .await;
        match renewed {
            Ok(_) => true,
            Err(err) => {
                warn!(asset_id, error = %err, "lease could not be confirmed");
                false
            }
        }
    }

    async fn finish_cancelled(&self, ctx: &mut JobContext) -> JobOutcome {
        self.clear_publication(ctx).await;
        match self
            .commit(ctx, Some(AssetStatus::Cancelled), Some("cancel requested"))
            .await
        {
            Ok(()) => JobOutcome::Cancelled,
            Err(err) => {
                warn!(asset_id = %ctx.asset.asset_id, error = %err, "could not record cancellation");
                JobOutcome::Abandoned(err.to_string())
            }
        }
    }

    async fn finish_failed(&self, ctx: &mut JobContext, err: PipelineError) -> JobOutcome {
        let kind = err.kind();
        warn!(asset_id = %ctx.asset.asset_id, error_kind = %kind, error = %err, "job failed");
        self.clear_publication(ctx).await;
        ctx.asset.record_failure(kind, err.detail());
        match self.commit(ctx, Some(AssetStatus::Failed), Some(kind.as_str())).await {
            Ok(()) => JobOutcome::Failed(kind),
            Err(store_err) => {
                warn!(asset_id = %ctx.asset.asset_id, error = %store_err, "could not record failure");
                JobOutcome::Abandoned(store_err.to_string())
            }
        }
    }
}

struct RenditionTask {
    asset_id: String,
    transcoder: Arc<dyn Transcoder>,
    pool: Arc<Semaphore>,
    input: String,
    dir: PathBuf,
    spec: RenditionSpec,
    policy: RetryPolicy,
    cancel: CancellationToken,
    events: mpsc::Sender<RenditionEvent>,
}

impl RenditionTask {
    async fn run(self) {
        let label = self.spec.label;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let permit = tokio::select! {
                permit = Arc::clone(&self.pool).acquire_owned() => permit,
                _ = self.cancel.cancelled() => {
                    self.finish(attempt, Err(TranscodeError::Cancelled { label })).await;
                    return;
                }
            };
            let Ok(permit) = permit else {
                self.finish(attempt, Err(TranscodeError::Cancelled { label })).await;
                return;
            };

            self.emit(RenditionEvent::Started { label, attempt }).await;
            let result = self
                .transcoder
                .transcode(&self.input, &self.spec, &self.dir, self.cancel.clone())
                .await;
            drop(permit);

            match result {
                Err(err) if err.is_transient() && attempt <= self.policy.max_retries => {
                    let delay = self.policy.compute_delay(attempt - 1);
                    warn!(
                        asset_id = %self.asset_id,
                        rendition = %label,
                        attempt,
                        wait = ?delay,
                        error = %err,
                        "retrying rendition"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            self.finish(attempt, Err(TranscodeError::Cancelled { label })).await;
                            return;
                        }
                    }
                }
                other => {
                    self.finish(attempt, other).await;
                    return;
                }
            }
        }
    }

    async fn finish(&self, attempt: u32, result: Result<RenditionOutput, TranscodeError>) {
        self.emit(RenditionEvent::Finished {
            label: self.spec.label,
            attempt,
            result,
        })
        .await;
    }

    async fn emit(&self, event: RenditionEvent) {
        if self.events.send(event).await.is_err() {
            debug!(
                asset_id = %self.asset_id,
                rendition = %self.spec.label,
                "job stopped listening; rendition event dropped"
            );
        }
    }
}

async fn remove_dir(path: &Path) {
    match fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "removed scratch directory"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove scratch directory"),
    }
}
