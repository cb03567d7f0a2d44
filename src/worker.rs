//! Capture workers and the bounded-concurrency worker pool
//!
//! A `CaptureWorker` drives a single item from claim to a terminal state:
//! rate-limit permit, render with classified retries and profile fallback,
//! artifact upload, final checkpoint. The `WorkerPool` fans pending items
//! out to a fixed number of workers over a shared channel, aggregates
//! terminal results into the job record, and reclaims expired leases.

use crate::artifact::ArtifactStore;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::error::{CaptureError, ErrorCategory};
use crate::job::{artifact_key, Item, ItemState, Job};
use crate::metrics::EngineMetrics;
use crate::rate_limit::RateLimiter;
use crate::renderer::Renderer;
use crate::retry::RetryPolicy;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Pool-level control signal, broadcast to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolControl {
    Run,
    /// Stop assigning new items; in-flight items finish or time out.
    Pause,
    /// Abort at the next suspension point; items stay as last checkpointed.
    Cancel,
}

/// Outcome of one worker pass over one item.
#[derive(Debug)]
pub enum WorkerResult {
    /// Item reached a terminal state and the checkpoint is durable.
    Terminal(Item),
    /// Another worker owns the item; nothing was done.
    Skipped(String),
    /// Worker gave up without a terminal mark (cancellation or a failed
    /// checkpoint write); the lease will expire and the item be reclaimed.
    Aborted(String, CaptureError),
}

pub struct CaptureWorker {
    id: usize,
    owner: String,
    renderer: Arc<dyn Renderer>,
    artifacts: Arc<dyn ArtifactStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    rate_limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    config: Config,
    metrics: Arc<EngineMetrics>,
    control: watch::Receiver<PoolControl>,
}

impl CaptureWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        renderer: Arc<dyn Renderer>,
        artifacts: Arc<dyn ArtifactStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        rate_limiter: Arc<RateLimiter>,
        config: Config,
        metrics: Arc<EngineMetrics>,
        control: watch::Receiver<PoolControl>,
    ) -> Self {
        let policy = RetryPolicy::new(&config.retry, config.max_retries);
        Self {
            id,
            owner: format!("worker-{}-{}", std::process::id(), id),
            renderer,
            artifacts,
            checkpoints,
            rate_limiter,
            policy,
            config,
            metrics,
            control,
        }
    }

    fn cancelled(&self) -> bool {
        *self.control.borrow() == PoolControl::Cancel
    }

    /// Drive one item to completion or terminal failure.
    ///
    /// No side effect happens before the claim succeeds, which bounds
    /// duplicate work to at most one in-flight attempt per item.
    pub async fn process_item(&self, job_id: &str, mut item: Item) -> WorkerResult {
        if self.cancelled() {
            return WorkerResult::Aborted(item.item_id.clone(), CaptureError::Cancelled);
        }

        match self
            .checkpoints
            .claim_item(job_id, &item.item_id, &self.owner, self.config.lease_ttl)
            .await
        {
            Ok(true) => {
                // A claim that succeeds on an InProgress item took over an
                // expired lease from a dead or stalled worker.
                if item.state == ItemState::InProgress {
                    self.metrics.record_reclaimed(1);
                    info!(
                        "Worker {} reclaimed item {} from an expired lease",
                        self.id, item.item_id
                    );
                }
            }
            Ok(false) => {
                debug!("Worker {} skipping claimed item {}", self.id, item.item_id);
                return WorkerResult::Skipped(item.item_id.clone());
            }
            Err(e) => return WorkerResult::Aborted(item.item_id.clone(), e),
        }
        item.state = ItemState::InProgress;

        let started = Instant::now();
        let result = self.render_and_upload(job_id, &mut item).await;

        match result {
            Ok(()) => {
                self.metrics.record_item(started.elapsed(), true);
                WorkerResult::Terminal(item)
            }
            Err(CaptureError::Cancelled) => {
                WorkerResult::Aborted(item.item_id.clone(), CaptureError::Cancelled)
            }
            Err(e @ CaptureError::CheckpointWrite(_)) => {
                // State must not be lost silently; leave the item for reclaim.
                error!(
                    "Worker {} aborting item {} on checkpoint failure: {e}",
                    self.id, item.item_id
                );
                WorkerResult::Aborted(item.item_id.clone(), e)
            }
            Err(e) => {
                warn!(
                    "Worker {} failed item {} ({}): {e}",
                    self.id,
                    item.item_id,
                    item.last_error_category
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unclassified".to_string())
                );
                self.metrics.record_item(started.elapsed(), false);
                match self.finish_failed(job_id, &mut item, &e).await {
                    Ok(()) => WorkerResult::Terminal(item),
                    Err(cp) => WorkerResult::Aborted(item.item_id.clone(), cp),
                }
            }
        }
    }

    /// The retry loop: primary profile within the attempt budget, then the
    /// degraded fallback profiles once each if the last failure was
    /// transient.
    async fn render_and_upload(&self, job_id: &str, item: &mut Item) -> Result<(), CaptureError> {
        let primary = self.config.render_profiles[0].clone();
        let mut last_error;

        loop {
            let is_retry = item.attempt_count > 0;
            match self.attempt_once(item, &primary, is_retry).await {
                Ok(pages) => return self.finish_succeeded(job_id, item, pages).await,
                Err(CaptureError::Cancelled) => return Err(CaptureError::Cancelled),
                Err(e @ CaptureError::CheckpointWrite(_)) => return Err(e),
                Err(e) => {
                    let decision = self.policy.decide(&e, item.attempt_count);
                    item.last_error_category = Some(decision.category);
                    self.checkpoint_progress(job_id, item).await?;

                    match decision.delay {
                        Some(delay) => {
                            debug!(
                                "Worker {} retrying item {} after {:?} (attempt {}/{})",
                                self.id,
                                item.item_id,
                                delay,
                                item.attempt_count,
                                self.policy.max_attempts()
                            );
                            self.cancellable_sleep(delay).await?;
                        }
                        None => {
                            last_error = e;
                            break;
                        }
                    }
                }
            }
        }

        // Two-tier strategy: full fidelity exhausted on a transient error,
        // degraded profiles get one shot each before giving up.
        if item.last_error_category == Some(ErrorCategory::Transient) {
            for profile in self.config.render_profiles.iter().skip(1) {
                self.metrics.record_fallback();
                info!(
                    "Worker {} trying fallback profile '{}' for item {}",
                    self.id, profile.name, item.item_id
                );
                match self.attempt_once(item, profile, true).await {
                    Ok(pages) => return self.finish_succeeded(job_id, item, pages).await,
                    Err(CaptureError::Cancelled) => return Err(CaptureError::Cancelled),
                    Err(e @ CaptureError::CheckpointWrite(_)) => return Err(e),
                    Err(e) => {
                        item.last_error_category = Some(self.policy.classify(&e));
                        self.checkpoint_progress(job_id, item).await?;
                        last_error = e;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// One rate-limited, time-bounded render attempt.
    async fn attempt_once(
        &self,
        item: &mut Item,
        profile: &crate::config::RenderProfile,
        is_retry: bool,
    ) -> Result<Vec<Vec<u8>>, CaptureError> {
        if self.cancelled() {
            return Err(CaptureError::Cancelled);
        }

        item.attempt_count += 1;
        self.metrics.record_attempt(is_retry);

        if let Err(e) = self
            .rate_limiter
            .acquire(self.config.rate_limit.acquire_timeout)
            .await
        {
            self.metrics.record_rate_limit_timeout();
            return Err(e);
        }

        if self.cancelled() {
            return Err(CaptureError::Cancelled);
        }

        match timeout(self.config.item_timeout, self.renderer.capture(item, profile)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::RenderTimeout(self.config.item_timeout)),
        }
    }

    async fn finish_succeeded(
        &self,
        job_id: &str,
        item: &mut Item,
        pages: Vec<Vec<u8>>,
    ) -> Result<(), CaptureError> {
        self.upload_pages(item, pages).await?;
        item.state = ItemState::Succeeded;
        item.last_error_category = None;
        self.checkpoints
            .write_checkpoint(job_id, item)
            .await
            .map_err(as_checkpoint_error)
    }

    async fn finish_failed(
        &self,
        job_id: &str,
        item: &mut Item,
        error: &CaptureError,
    ) -> Result<(), CaptureError> {
        item.state = match error {
            // Render succeeded but the artifact never landed; retryable on a
            // later run, so not a permanent verdict on the tweet itself.
            CaptureError::Upload { .. } => {
                item.last_error_category = Some(error.category());
                ItemState::Failed
            }
            _ => ItemState::PermanentlyFailed,
        };
        self.checkpoints
            .write_checkpoint(job_id, item)
            .await
            .map_err(as_checkpoint_error)
    }

    /// Record attempt progress on the still-InProgress item.
    async fn checkpoint_progress(&self, job_id: &str, item: &Item) -> Result<(), CaptureError> {
        self.checkpoints
            .write_checkpoint(job_id, item)
            .await
            .map_err(as_checkpoint_error)
    }

    /// Upload every page buffer under its deterministic key; a key that
    /// already exists is a completed upload from a previous attempt.
    async fn upload_pages(
        &self,
        item: &mut Item,
        pages: Vec<Vec<u8>>,
    ) -> Result<(), CaptureError> {
        let captured_at = Utc::now();
        for (n, page) in pages.iter().enumerate() {
            let key = artifact_key(item, captured_at, n, self.config.output_format);
            if self.artifacts.exists(&key).await.unwrap_or(false) {
                item.artifact_keys.push(key);
                continue;
            }

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.artifacts.put(&key, page).await {
                    Ok(()) => {
                        self.metrics.record_upload();
                        item.artifact_keys.push(key.clone());
                        break;
                    }
                    Err(e) if attempt < self.config.upload_retries => {
                        warn!(
                            "Upload of {key} failed (attempt {attempt}/{}): {e}",
                            self.config.upload_retries
                        );
                        self.cancellable_sleep(Duration::from_millis(250)).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Sleep that wakes early on cancellation, so a cancel signal reaches
    /// the worker within one retry interval.
    async fn cancellable_sleep(&self, delay: Duration) -> Result<(), CaptureError> {
        let mut control = self.control.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = control.wait_for(|c| *c == PoolControl::Cancel) => Err(CaptureError::Cancelled),
        }
    }
}

/// Store failures during a checkpoint write all surface as
/// `CheckpointWrite` so the worker aborts instead of misclassifying them
/// as render failures.
fn as_checkpoint_error(e: CaptureError) -> CaptureError {
    match e {
        CaptureError::CheckpointWrite(_) => e,
        other => CaptureError::CheckpointWrite(other.to_string()),
    }
}

/// Aggregate result of one pool run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRun {
    pub completed: usize,
    pub failed: usize,
    pub interrupted: bool,
}

/// Bounded-concurrency scheduler for one job's pending items.
///
/// The rate limiter is injected rather than owned: it is the process-wide
/// budget against the external fetch host, shared by every pool the process
/// runs.
pub struct WorkerPool {
    config: Config,
    renderer: Arc<dyn Renderer>,
    artifacts: Arc<dyn ArtifactStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<EngineMetrics>,
    control_tx: watch::Sender<PoolControl>,
}

impl WorkerPool {
    pub fn new(
        config: Config,
        renderer: Arc<dyn Renderer>,
        artifacts: Arc<dyn ArtifactStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (control_tx, _) = watch::channel(PoolControl::Run);
        Self {
            config,
            renderer,
            artifacts,
            checkpoints,
            rate_limiter,
            metrics,
            control_tx,
        }
    }

    /// Handle for pausing or cancelling the running pool.
    pub fn control(&self) -> watch::Sender<PoolControl> {
        self.control_tx.clone()
    }

    /// Drain every claimable item of the job, updating the job's aggregate
    /// counters as items reach terminal states. Returns once no claimable
    /// work remains or the pool is paused/cancelled.
    pub async fn run(&self, job: &mut Job) -> Result<PoolRun, CaptureError> {
        let concurrency = job
            .concurrency
            .unwrap_or(self.config.concurrency)
            .max(1);
        let mut run = PoolRun {
            completed: 0,
            failed: 0,
            interrupted: false,
        };

        loop {
            if *self.control_tx.borrow() != PoolControl::Run {
                run.interrupted = true;
                break;
            }

            let items = self.checkpoints.list_items(&job.job_id).await?;
            let now = Utc::now();
            let claimable: Vec<Item> = items
                .iter()
                .filter(|i| i.is_claimable(now))
                .cloned()
                .collect();

            if claimable.is_empty() {
                let outstanding = items.iter().filter(|i| !i.state.is_terminal()).count();
                if outstanding == 0 {
                    break;
                }
                // Items are stuck behind live leases; wait for the earliest
                // expiry so a crashed worker's claim gets reclaimed.
                let wait = items
                    .iter()
                    .filter_map(|i| i.lease.as_ref())
                    .map(|l| (l.expires_at - now).to_std().unwrap_or(Duration::ZERO))
                    .min()
                    .unwrap_or(self.config.lease_ttl);
                info!(
                    "{} items outstanding behind live leases; waiting {:?}",
                    outstanding, wait
                );
                let mut control = self.control_tx.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(wait + Duration::from_millis(50)) => {}
                    _ = control.wait_for(|c| *c != PoolControl::Run) => {
                        run.interrupted = true;
                        break;
                    }
                }
                continue;
            }

            let round = self.run_round(job, claimable, concurrency).await?;
            run.completed += round.completed;
            run.failed += round.failed;
            if round.interrupted {
                run.interrupted = true;
                break;
            }
        }

        Ok(run)
    }

    /// One pass over a batch of claimable items with `concurrency` workers.
    async fn run_round(
        &self,
        job: &mut Job,
        items: Vec<Item>,
        concurrency: usize,
    ) -> Result<PoolRun, CaptureError> {
        let total = items.len();
        info!(
            "Dispatching {} items for job {} across {} workers",
            total, job.job_id, concurrency
        );

        let (item_tx, item_rx) = mpsc::channel::<Item>(total.max(1));
        let (result_tx, mut result_rx) = mpsc::channel::<WorkerResult>(total.max(1));
        let shared_rx = Arc::new(Mutex::new(item_rx));

        for item in items {
            // Capacity equals the batch size; send cannot block.
            if item_tx.send(item).await.is_err() {
                break;
            }
        }
        drop(item_tx);

        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(concurrency);
        for id in 0..concurrency {
            let worker = CaptureWorker::new(
                id,
                self.renderer.clone(),
                self.artifacts.clone(),
                self.checkpoints.clone(),
                self.rate_limiter.clone(),
                self.config.clone(),
                self.metrics.clone(),
                self.control_tx.subscribe(),
            );
            let rx = shared_rx.clone();
            let tx = result_tx.clone();
            let job_id = job.job_id.clone();
            let mut control = self.control_tx.subscribe();
            let active = active.clone();
            let metrics = self.metrics.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if *control.borrow() != PoolControl::Run {
                        break;
                    }
                    // A pause must reach workers parked on the queue, not
                    // just between items.
                    let item = {
                        let mut receiver = rx.lock().await;
                        tokio::select! {
                            item = receiver.recv() => item,
                            _ = control.wait_for(|c| *c != PoolControl::Run) => None,
                        }
                    };
                    match item {
                        Some(item) => {
                            metrics.set_in_progress(active.fetch_add(1, Ordering::SeqCst) + 1);
                            let result = worker.process_item(&job_id, item).await;
                            metrics.set_in_progress(active.fetch_sub(1, Ordering::SeqCst) - 1);
                            if tx.send(result).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }));
        }
        drop(result_tx);

        let mut round = PoolRun {
            completed: 0,
            failed: 0,
            interrupted: false,
        };
        let mut drain_timed_out = false;
        let mut control = self.control_tx.subscribe();

        loop {
            let next = tokio::select! {
                result = result_rx.recv() => result,
                // The nested async block drops the non-Send watch::Ref before
                // the drain loop awaits, keeping this future Send for spawn.
                _ = async { control.wait_for(|c| *c != PoolControl::Run).await.map(|_| ()) } => {
                    round.interrupted = true;
                    // Pause/cancel opens a bounded drain window: in-flight
                    // items get drain_timeout to reach a terminal
                    // checkpoint, then stragglers are cut loose and their
                    // leases expire into the reclaim path.
                    let deadline =
                        tokio::time::Instant::now() + self.config.drain_timeout;
                    loop {
                        match tokio::time::timeout_at(deadline, result_rx.recv()).await {
                            Ok(Some(result)) => {
                                self.record_result(job, &mut round, result).await?;
                            }
                            Ok(None) => break,
                            Err(_) => {
                                warn!(
                                    "Drain window of {:?} elapsed with items still in flight",
                                    self.config.drain_timeout
                                );
                                drain_timed_out = true;
                                break;
                            }
                        }
                    }
                    break;
                }
            };
            match next {
                Some(result) => self.record_result(job, &mut round, result).await?,
                None => break,
            }
        }

        for handle in handles {
            if drain_timed_out {
                handle.abort();
            } else if let Err(e) = handle.await {
                // A panicked worker leaves its item leased; the reclaim
                // sweep picks it up after expiry.
                error!("Worker task failed: {e}");
            }
        }

        if *self.control_tx.borrow() != PoolControl::Run {
            round.interrupted = true;
        }
        Ok(round)
    }

    /// Fold one worker result into the round and the job's durable counters.
    async fn record_result(
        &self,
        job: &mut Job,
        round: &mut PoolRun,
        result: WorkerResult,
    ) -> Result<(), CaptureError> {
        match result {
            WorkerResult::Terminal(item) => {
                match item.state {
                    ItemState::Succeeded => {
                        job.completed_items += 1;
                        round.completed += 1;
                    }
                    _ => {
                        job.failed_items += 1;
                        round.failed += 1;
                    }
                }
                job.touch();
                self.checkpoints.save_job(job).await?;
            }
            WorkerResult::Skipped(item_id) => {
                debug!("Item {item_id} skipped (claim conflict)");
            }
            WorkerResult::Aborted(item_id, CaptureError::Cancelled) => {
                debug!("Item {item_id} aborted by cancellation");
                round.interrupted = true;
            }
            WorkerResult::Aborted(item_id, e) => {
                warn!("Item {item_id} aborted without terminal state: {e}");
            }
        }
        Ok(())
    }
}
