//! Job lifecycle management
//!
//! The `JobManager` is the boundary the dispatch control plane talks to. It
//! owns the job state machine (`Queued → Running → {Completed, Failed,
//! Cancelled}`, with `Running ⇄ Paused`), enumerates items at creation,
//! drives the worker pool, and aggregates item states into the job record.

use crate::artifact::ArtifactStore;
use crate::checkpoint::CheckpointStore;
use crate::config::{Config, JobSpec};
use crate::error::{CaptureError, ErrorCategory};
use crate::job::{Item, ItemState, Job, JobStatus};
use crate::metrics::EngineMetrics;
use crate::rate_limit::RateLimiter;
use crate::renderer::Renderer;
use crate::source::TweetSource;
use crate::worker::{PoolControl, WorkerPool};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// Status snapshot returned to the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub failed: Vec<FailedItem>,
}

/// Per-item failure detail, so an operator can tell "renderer is down"
/// apart from "this tweet is gone".
#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub item_id: String,
    pub account: String,
    pub attempts: usize,
    pub category: Option<ErrorCategory>,
}

pub struct JobManager {
    config: Config,
    checkpoints: Arc<dyn CheckpointStore>,
    artifacts: Arc<dyn ArtifactStore>,
    renderer: Arc<dyn Renderer>,
    source: Arc<dyn TweetSource>,
    /// Process-wide fetch budget, shared by every pool this manager runs.
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<EngineMetrics>,
    /// Control handles of pools currently running in this process.
    active: Mutex<HashMap<String, watch::Sender<PoolControl>>>,
}

impl JobManager {
    pub fn new(
        config: Config,
        checkpoints: Arc<dyn CheckpointStore>,
        artifacts: Arc<dyn ArtifactStore>,
        renderer: Arc<dyn Renderer>,
        source: Arc<dyn TweetSource>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        Self {
            config,
            checkpoints,
            artifacts,
            renderer,
            source,
            rate_limiter,
            metrics: Arc::new(EngineMetrics::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a new job and its enumerated pending items. The job starts
    /// Queued; no capture work happens until `start`.
    pub async fn create_job(&self, spec: &JobSpec) -> Result<Job, CaptureError> {
        spec.validate()?;

        let mut job = Job::new(spec);
        let mut items: Vec<Item> = Vec::new();
        for account in &spec.accounts {
            match self
                .source
                .fetch_recent(account, spec.days_back, spec.max_tweets_per_account)
                .await
            {
                Ok(tweets) => items.extend(tweets.iter().map(Item::from_tweet)),
                Err(CaptureError::NotFound(_)) => {
                    warn!("Account @{account} not found; skipping");
                }
                Err(e) => return Err(e),
            }
        }

        job.total_items = items.len();
        self.checkpoints.create_job(&job, &items).await?;
        info!(
            "Created job {} with {} items across {} accounts",
            job.job_id,
            job.total_items,
            job.accounts.len()
        );
        Ok(job)
    }

    /// Run a queued or paused job to a settle point: terminal, paused, or
    /// cancelled. Blocks for the duration of the run.
    pub async fn start(&self, job_id: &str) -> Result<JobStatus, CaptureError> {
        let mut job = self.checkpoints.load_job(job_id).await?;
        transition(&mut job, JobStatus::Running)?;
        self.checkpoints.save_job(&job).await?;
        self.run_pool(job).await
    }

    /// Rebuild a job's state purely from the checkpoint store and continue
    /// it. Items left InProgress past their lease become claimable again;
    /// terminal items are never reprocessed.
    pub async fn resume(&self, job_id: &str) -> Result<JobStatus, CaptureError> {
        let mut job = self.checkpoints.load_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(CaptureError::InvalidTransition(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        let items = self.checkpoints.list_items(job_id).await?;
        job.total_items = items.len();
        recount(&mut job, &items);

        // A job found Running here was interrupted by a crash; keep the
        // state rather than rejecting the restart.
        if job.status != JobStatus::Running {
            transition(&mut job, JobStatus::Running)?;
        }
        self.checkpoints.save_job(&job).await?;
        info!(
            "Resuming job {}: {}/{} terminal before restart",
            job.job_id,
            job.completed_items + job.failed_items,
            job.total_items
        );
        self.run_pool(job).await
    }

    /// Stop assigning new items to the running pool; in-flight items finish
    /// within the drain window.
    pub async fn pause(&self, job_id: &str) -> Result<(), CaptureError> {
        let active = self.active.lock().await;
        match active.get(job_id) {
            Some(control) => {
                let _ = control.send(PoolControl::Pause);
                Ok(())
            }
            None => Err(CaptureError::InvalidTransition(format!(
                "job {job_id} is not running in this process"
            ))),
        }
    }

    /// Cancel a job. A running pool is signalled and aborts at its next
    /// suspension point; a queued or paused job is cancelled in the store.
    pub async fn cancel(&self, job_id: &str) -> Result<(), CaptureError> {
        {
            let active = self.active.lock().await;
            if let Some(control) = active.get(job_id) {
                let _ = control.send(PoolControl::Cancel);
                return Ok(());
            }
        }

        let mut job = self.checkpoints.load_job(job_id).await?;
        transition(&mut job, JobStatus::Cancelled)?;
        self.checkpoints.save_job(&job).await?;
        info!("Cancelled job {job_id}");
        Ok(())
    }

    /// Pause every pool running in this process. Shutdown path: in-flight
    /// items finish, the runs settle as Paused, and a later `resume` picks
    /// up from the checkpoints.
    pub async fn pause_all(&self) {
        for control in self.active.lock().await.values() {
            let _ = control.send(PoolControl::Pause);
        }
    }

    /// Current job status with per-item failure detail.
    pub async fn status(&self, job_id: &str) -> Result<JobReport, CaptureError> {
        let job = self.checkpoints.load_job(job_id).await?;
        let items = self.checkpoints.list_items(job_id).await?;

        let failed = items
            .iter()
            .filter(|i| matches!(i.state, ItemState::Failed | ItemState::PermanentlyFailed))
            .map(|i| FailedItem {
                item_id: i.item_id.clone(),
                account: i.account.clone(),
                attempts: i.attempt_count,
                category: i.last_error_category,
            })
            .collect();

        Ok(JobReport {
            job_id: job.job_id.clone(),
            status: job.status,
            total_items: job.total_items,
            completed_items: job.completed_items,
            failed_items: job.failed_items,
            failed,
        })
    }

    async fn run_pool(&self, mut job: Job) -> Result<JobStatus, CaptureError> {
        let pool = WorkerPool::new(
            self.config.clone(),
            self.renderer.clone(),
            self.artifacts.clone(),
            self.checkpoints.clone(),
            self.rate_limiter.clone(),
            self.metrics.clone(),
        );
        let control = pool.control();
        self.active
            .lock()
            .await
            .insert(job.job_id.clone(), control.clone());

        let result = pool.run(&mut job).await;
        self.active.lock().await.remove(&job.job_id);

        match result {
            Ok(_) => self.finalize(&mut job, &control).await,
            Err(e) => {
                // Pool-level failure (store unreachable, enumeration lost):
                // pause and surface instead of silently stalling.
                warn!("Pausing job {} on pool error: {e}", job.job_id);
                if transition(&mut job, JobStatus::Paused).is_ok() {
                    let _ = self.checkpoints.save_job(&job).await;
                }
                Err(e)
            }
        }
    }

    /// Recompute aggregates from the store and settle the job's status.
    async fn finalize(
        &self,
        job: &mut Job,
        control: &watch::Sender<PoolControl>,
    ) -> Result<JobStatus, CaptureError> {
        let items = self.checkpoints.list_items(&job.job_id).await?;
        recount(job, &items);

        let next = match *control.borrow() {
            PoolControl::Cancel => JobStatus::Cancelled,
            PoolControl::Pause => JobStatus::Paused,
            PoolControl::Run => {
                if job.all_terminal() {
                    if job.failed_items > 0 && job.failure_ratio() >= self.config.failure_threshold
                    {
                        JobStatus::Failed
                    } else {
                        JobStatus::Completed
                    }
                } else {
                    // Drained without terminal coverage; keep the job
                    // resumable.
                    JobStatus::Paused
                }
            }
        };

        transition(job, next)?;
        self.checkpoints.save_job(job).await?;
        info!(
            "Job {} settled as {} ({} succeeded, {} failed, {} total)",
            job.job_id, job.status, job.completed_items, job.failed_items, job.total_items
        );
        Ok(job.status)
    }
}

fn recount(job: &mut Job, items: &[Item]) {
    job.completed_items = items
        .iter()
        .filter(|i| i.state == ItemState::Succeeded)
        .count();
    job.failed_items = items
        .iter()
        .filter(|i| matches!(i.state, ItemState::Failed | ItemState::PermanentlyFailed))
        .count();
    job.touch();
}

/// Apply a state transition, rejecting anything the state machine forbids.
/// Same-state transitions are no-ops.
fn transition(job: &mut Job, next: JobStatus) -> Result<(), CaptureError> {
    if job.status == next {
        return Ok(());
    }
    if !job.status.can_transition_to(next) {
        return Err(CaptureError::InvalidTransition(format!(
            "{} -> {}",
            job.status, next
        )));
    }
    job.status = next;
    job.touch();
    Ok(())
}
