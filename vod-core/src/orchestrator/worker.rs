use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::asset::StoreResult;
use crate::config::PipelineConfig;

use super::{JobReport, Orchestrator};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub max_active_jobs: usize,
    pub idle_poll: Duration,
    pub lease_ttl: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            worker_id: default_worker_id(),
            max_active_jobs: config.worker.max_active_jobs.max(1),
            idle_poll: config.worker.idle_poll(),
            lease_ttl: config.lease.ttl(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

fn default_worker_id() -> String {
    format!("worker-{}-{}", std::process::id(), Uuid::new_v4().simple())
}

/// Claims queued or abandoned jobs and runs them through the orchestrator.
pub struct Worker {
    orchestrator: Orchestrator,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(orchestrator: Orchestrator, settings: WorkerSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Claims at most one job and runs it to completion.
    pub async fn tick(&self) -> StoreResult<Option<JobReport>> {
        let claimed = self
            .orchestrator
            .store()
            .claim_next_async(&self.settings.worker_id, self.settings.lease_ttl)
            .await?;
        let Some(claimed) = claimed else {
            return Ok(None);
        };
        Ok(Some(
            self.orchestrator
                .run_job(claimed, &self.settings.worker_id)
                .await,
        ))
    }

    /// Polls for work until `shutdown` fires, keeping up to
    /// `max_active_jobs` jobs in flight. Jobs already running are allowed to
    /// finish before this returns.
    pub async fn run_loop(&self, shutdown: CancellationToken) -> StoreResult<Vec<JobReport>> {
        info!(
            worker_id = %self.settings.worker_id,
            max_active_jobs = self.settings.max_active_jobs,
            "worker started"
        );
        let mut active: JoinSet<JobReport> = JoinSet::new();
        let mut reports = Vec::new();

        while !shutdown.is_cancelled() {
            if active.len() < self.settings.max_active_jobs {
                match self
                    .orchestrator
                    .store()
                    .claim_next_async(&self.settings.worker_id, self.settings.lease_ttl)
                    .await
                {
                    Ok(Some(claimed)) => {
                        let orchestrator = self.orchestrator.clone();
                        let worker_id = self.settings.worker_id.clone();
                        active.spawn(async move { orchestrator.run_job(claimed, &worker_id).await });
                        continue;
                    }
                    Ok(None) => debug!(worker_id = %self.settings.worker_id, "no claimable job"),
                    Err(err) if err.is_transient() => {
                        warn!(worker_id = %self.settings.worker_id, error = %err, "claim deferred");
                    }
                    Err(err) => {
                        error!(worker_id = %self.settings.worker_id, error = %err, "claim failed");
                        drain(&mut active, &mut reports).await;
                        return Err(err);
                    }
                }
            }

            tokio::select! {
                Some(joined) = active.join_next(), if !active.is_empty() => {
                    collect(joined, &mut reports);
                }
                _ = sleep(self.settings.idle_poll) => {}
                _ = shutdown.cancelled() => {}
            }
        }

        info!(
            worker_id = %self.settings.worker_id,
            active = active.len(),
            "worker stopping; waiting for running jobs"
        );
        drain(&mut active, &mut reports).await;
        Ok(reports)
    }
}

async fn drain(active: &mut JoinSet<JobReport>, reports: &mut Vec<JobReport>) {
    while let Some(joined) = active.join_next().await {
        collect(joined, reports);
    }
}

fn collect(joined: Result<JobReport, tokio::task::JoinError>, reports: &mut Vec<JobReport>) {
    match joined {
        Ok(report) => reports.push(report),
        Err(err) => error!(error = %err, "job task panicked"),
    }
}
