//! End-to-end engine tests over scripted renderers and sources.

use crate::artifact::MemoryArtifactStore;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{Config, JobSpec, RateLimitConfig, RenderProfile, RetryConfig};
use crate::error::{CaptureError, ErrorCategory};
use crate::job::{Item, ItemKind, ItemState, Job, JobStatus, Tweet};
use crate::manager::JobManager;
use crate::metrics::EngineMetrics;
use crate::rate_limit::RateLimiter;
use crate::renderer::Renderer;
use crate::source::TweetSource;
use crate::worker::WorkerPool;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type RenderScript =
    Box<dyn Fn(&Item, &RenderProfile) -> Result<Vec<Vec<u8>>, CaptureError> + Send + Sync>;

/// Renderer driven by a per-item script, tracking call and concurrency
/// counts.
struct ScriptedRenderer {
    script: RenderScript,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    rendered: Mutex<Vec<String>>,
}

impl ScriptedRenderer {
    fn new(script: RenderScript) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            rendered: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn always_ok() -> Self {
        Self::new(Box::new(|_, _| Ok(vec![b"png".to_vec()])))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn rendered_ids(&self) -> HashSet<String> {
        self.rendered.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn capture(
        &self,
        item: &Item,
        profile: &RenderProfile,
    ) -> Result<Vec<Vec<u8>>, CaptureError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rendered.lock().unwrap().push(item.item_id.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = (self.script)(item, profile);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Source yielding `per_account` synthetic tweets for every account.
struct StaticSource {
    per_account: usize,
}

#[async_trait]
impl TweetSource for StaticSource {
    async fn fetch_recent(
        &self,
        account: &str,
        _days_back: i64,
        max: usize,
    ) -> Result<Vec<Tweet>, CaptureError> {
        Ok((0..self.per_account.min(max))
            .map(|i| Tweet {
                id: format!("{account}-{i}"),
                account: account.to_string(),
                kind: ItemKind::Tweet,
                created_at: Utc::now(),
            })
            .collect())
    }
}

/// Artifact store whose every put fails, for upload-failure paths.
struct BrokenArtifactStore;

#[async_trait]
impl crate::artifact::ArtifactStore for BrokenArtifactStore {
    async fn put(&self, key: &str, _bytes: &[u8]) -> Result<(), CaptureError> {
        Err(CaptureError::Upload {
            key: key.to_string(),
            reason: "bucket offline".to_string(),
        })
    }

    async fn exists(&self, _key: &str) -> Result<bool, CaptureError> {
        Ok(false)
    }
}

fn test_config(dir: &TempDir) -> Config {
    Config {
        concurrency: 4,
        max_retries: 3,
        retry: RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        },
        rate_limit: RateLimitConfig {
            permits_per_second: 10_000.0,
            burst: 1_000,
            acquire_timeout: Duration::from_secs(5),
        },
        item_timeout: Duration::from_secs(2),
        lease_ttl: Duration::from_secs(2),
        data_dir: dir.path().join("data"),
        artifact_dir: dir.path().join("artifacts"),
        ..Config::default()
    }
}

fn spec(accounts: &[&str]) -> JobSpec {
    JobSpec {
        accounts: accounts.iter().map(|a| a.to_string()).collect(),
        days_back: 7,
        max_tweets_per_account: 50,
        concurrency: None,
    }
}

struct Harness {
    manager: Arc<JobManager>,
    renderer: Arc<ScriptedRenderer>,
    artifacts: Arc<MemoryArtifactStore>,
    checkpoints: Arc<FileCheckpointStore>,
    _dir: TempDir,
}

fn harness(renderer: ScriptedRenderer, per_account: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let renderer = Arc::new(renderer);
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let checkpoints = Arc::new(FileCheckpointStore::new(config.data_dir.clone()));
    let manager = Arc::new(JobManager::new(
        config,
        checkpoints.clone(),
        artifacts.clone(),
        renderer.clone(),
        Arc::new(StaticSource { per_account }),
    ));
    Harness {
        manager,
        renderer,
        artifacts,
        checkpoints,
        _dir: dir,
    }
}

#[tokio::test]
async fn successful_job_completes_with_unique_artifacts() {
    let h = harness(ScriptedRenderer::always_ok(), 5);

    let job = h.manager.create_job(&spec(&["nasa", "esa"])).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.total_items, 10);

    let status = h.manager.start(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.completed_items, 10);
    assert_eq!(report.failed_items, 0);
    assert!(report.failed.is_empty());

    assert_eq!(h.renderer.calls(), 10);
    assert_eq!(h.artifacts.len(), 10);
    let keys: HashSet<String> = h.artifacts.keys().into_iter().collect();
    assert_eq!(keys.len(), 10);
}

#[tokio::test]
async fn transient_failures_exhaust_retries_then_fallback() {
    let renderer = ScriptedRenderer::new(Box::new(|_, _| {
        Err(CaptureError::ConnectionError("refused".to_string()))
    }));
    let h = harness(renderer, 5);

    let job = h.manager.create_job(&spec(&["nasa"])).await.unwrap();
    let status = h.manager.start(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Failed);

    let items = h.checkpoints.list_items(&job.job_id).await.unwrap();
    for item in &items {
        assert_eq!(item.state, ItemState::PermanentlyFailed);
        // Three primary attempts plus one shot at the degraded profile.
        assert_eq!(item.attempt_count, 4);
        assert_eq!(item.last_error_category, Some(ErrorCategory::Transient));
        assert!(item.lease.is_none());
    }
    assert_eq!(h.renderer.calls(), 20);
    assert!(h.artifacts.is_empty());
}

#[tokio::test]
async fn fallback_profile_rescues_a_flaky_item() {
    // Full profile always fails transiently; the degraded profile succeeds.
    let renderer = ScriptedRenderer::new(Box::new(|_, profile| {
        if profile.name == "full" {
            Err(CaptureError::RenderTimeout(Duration::from_secs(1)))
        } else {
            Ok(vec![b"png".to_vec()])
        }
    }));
    let h = harness(renderer, 1);

    let job = h.manager.create_job(&spec(&["nasa"])).await.unwrap();
    let status = h.manager.start(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    let items = h.checkpoints.list_items(&job.job_id).await.unwrap();
    assert_eq!(items[0].state, ItemState::Succeeded);
    assert_eq!(items[0].attempt_count, 4);
    assert_eq!(items[0].last_error_category, None);
    assert_eq!(items[0].artifact_keys.len(), 1);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let renderer = ScriptedRenderer::new(Box::new(|item, _| {
        if item.item_id == "nasa-3" {
            Err(CaptureError::NotFound("tweet deleted".to_string()))
        } else {
            Ok(vec![b"png".to_vec()])
        }
    }));
    let h = harness(renderer, 10);

    let job = h.manager.create_job(&spec(&["nasa"])).await.unwrap();
    let status = h.manager.start(&job.job_id).await.unwrap();

    // One permanent failure out of ten stays under the failure threshold.
    assert_eq!(status, JobStatus::Completed);

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.completed_items, 9);
    assert_eq!(report.failed_items, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].item_id, "nasa-3");
    assert_eq!(report.failed[0].attempts, 1);
    assert_eq!(report.failed[0].category, Some(ErrorCategory::Permanent));

    let items = h.checkpoints.list_items(&job.job_id).await.unwrap();
    let failed = items.iter().find(|i| i.item_id == "nasa-3").unwrap();
    assert_eq!(failed.state, ItemState::PermanentlyFailed);
}

#[tokio::test]
async fn failure_threshold_marks_job_failed() {
    // Six of ten items are gone: 0.6 >= 0.5 threshold.
    let renderer = ScriptedRenderer::new(Box::new(|item, _| {
        let n: usize = item.item_id.rsplit('-').next().unwrap().parse().unwrap();
        if n < 6 {
            Err(CaptureError::NotFound("tweet deleted".to_string()))
        } else {
            Ok(vec![b"png".to_vec()])
        }
    }));
    let h = harness(renderer, 10);

    let job = h.manager.create_job(&spec(&["nasa"])).await.unwrap();
    let status = h.manager.start(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Failed);

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.completed_items, 4);
    assert_eq!(report.failed_items, 6);
}

#[tokio::test]
async fn resume_skips_already_completed_items() {
    let h = harness(ScriptedRenderer::always_ok(), 10);

    let job = h.manager.create_job(&spec(&["nasa"])).await.unwrap();

    // Simulate an interrupted earlier run that finished three items.
    let mut items = h.checkpoints.list_items(&job.job_id).await.unwrap();
    for item in items.iter_mut().take(3) {
        item.state = ItemState::Succeeded;
        item.attempt_count = 1;
        item.artifact_keys = vec![format!("prior/{}.png", item.item_id)];
        h.checkpoints
            .write_checkpoint(&job.job_id, item)
            .await
            .unwrap();
    }

    let status = h.manager.resume(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.completed_items, 10);
    assert_eq!(report.failed_items, 0);

    // Only the seven unfinished items were rendered again.
    let rendered = h.renderer.rendered_ids();
    assert_eq!(rendered.len(), 7);
    assert!(!rendered.contains("nasa-0"));
    assert!(!rendered.contains("nasa-1"));
    assert!(!rendered.contains("nasa-2"));
}

#[tokio::test]
async fn concurrency_stays_within_the_configured_bound() {
    let renderer = ScriptedRenderer::always_ok().with_delay(Duration::from_millis(40));
    let h = harness(renderer, 8);

    let mut job_spec = spec(&["nasa"]);
    job_spec.concurrency = Some(2);

    let job = h.manager.create_job(&job_spec).await.unwrap();
    let status = h.manager.start(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    assert_eq!(h.renderer.calls(), 8);
    assert!(h.renderer.max_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn cancelled_queued_job_rejects_start_and_resume() {
    let h = harness(ScriptedRenderer::always_ok(), 3);

    let job = h.manager.create_job(&spec(&["nasa"])).await.unwrap();
    h.manager.cancel(&job.job_id).await.unwrap();

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);

    assert!(matches!(
        h.manager.start(&job.job_id).await,
        Err(CaptureError::InvalidTransition(_))
    ));
    assert!(matches!(
        h.manager.resume(&job.job_id).await,
        Err(CaptureError::InvalidTransition(_))
    ));
    assert_eq!(h.renderer.calls(), 0);
}

#[tokio::test]
async fn cancelling_a_running_job_preserves_checkpointed_progress() {
    let renderer = ScriptedRenderer::always_ok().with_delay(Duration::from_millis(100));
    let h = harness(renderer, 10);

    let mut job_spec = spec(&["nasa"]);
    job_spec.concurrency = Some(1);
    let job = h.manager.create_job(&job_spec).await.unwrap();

    let manager = h.manager.clone();
    let job_id = job.job_id.clone();
    let run = tokio::spawn(async move { manager.start(&job_id).await });

    tokio::time::sleep(Duration::from_millis(250)).await;
    h.manager.cancel(&job.job_id).await.unwrap();

    let status = run.await.unwrap().unwrap();
    assert_eq!(status, JobStatus::Cancelled);

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert!(report.completed_items >= 1);
    assert!(report.completed_items < 10);

    // Finished items kept their artifacts and terminal checkpoints.
    let items = h.checkpoints.list_items(&job.job_id).await.unwrap();
    let succeeded = items
        .iter()
        .filter(|i| i.state == ItemState::Succeeded)
        .count();
    assert_eq!(succeeded, report.completed_items);
    assert_eq!(h.artifacts.len(), succeeded);
}

#[tokio::test]
async fn paused_job_settles_and_resumes_to_completion() {
    let renderer = ScriptedRenderer::always_ok().with_delay(Duration::from_millis(100));
    let h = harness(renderer, 10);

    let mut job_spec = spec(&["nasa"]);
    job_spec.concurrency = Some(1);
    let job = h.manager.create_job(&job_spec).await.unwrap();

    let manager = h.manager.clone();
    let job_id = job.job_id.clone();
    let run = tokio::spawn(async move { manager.start(&job_id).await });

    tokio::time::sleep(Duration::from_millis(250)).await;
    h.manager.pause(&job.job_id).await.unwrap();

    let status = run.await.unwrap().unwrap();
    assert_eq!(status, JobStatus::Paused);

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Paused);
    assert!(report.completed_items >= 1);
    assert!(report.completed_items < 10);

    // Resuming picks up from the checkpoints; nothing is rendered twice.
    let resumed = h.manager.resume(&job.job_id).await.unwrap();
    assert_eq!(resumed, JobStatus::Completed);

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.completed_items, 10);
    assert_eq!(report.failed_items, 0);
    assert_eq!(h.renderer.calls(), 10);
}

#[tokio::test]
async fn pause_drain_window_bounds_inflight_items() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.drain_timeout = Duration::from_millis(100);
    config.item_timeout = Duration::from_secs(10);
    config.lease_ttl = Duration::from_secs(10);

    // The render never finishes within the drain window.
    let renderer =
        Arc::new(ScriptedRenderer::always_ok().with_delay(Duration::from_secs(10)));
    let checkpoints = Arc::new(FileCheckpointStore::new(config.data_dir.clone()));
    let manager = Arc::new(JobManager::new(
        config,
        checkpoints.clone(),
        Arc::new(MemoryArtifactStore::new()),
        renderer,
        Arc::new(StaticSource { per_account: 1 }),
    ));

    let job = manager.create_job(&spec(&["nasa"])).await.unwrap();

    let started = std::time::Instant::now();
    let runner = manager.clone();
    let job_id = job.job_id.clone();
    let run = tokio::spawn(async move { runner.start(&job_id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.pause(&job.job_id).await.unwrap();

    // The run settles within the drain window, not the render's duration.
    let status = run.await.unwrap().unwrap();
    assert_eq!(status, JobStatus::Paused);
    assert!(started.elapsed() < Duration::from_secs(3));

    // The straggler keeps its lease and stays non-terminal for reclaim.
    let items = checkpoints.list_items(&job.job_id).await.unwrap();
    assert_eq!(items[0].state, ItemState::InProgress);
    assert!(items[0].lease.is_some());
}

#[tokio::test]
async fn expired_lease_item_is_reclaimed_and_processed() {
    let h = harness(ScriptedRenderer::always_ok(), 3);

    let job = h.manager.create_job(&spec(&["nasa"])).await.unwrap();

    // A worker from a previous run claimed an item and died.
    assert!(h
        .checkpoints
        .claim_item(&job.job_id, "nasa-1", "stale-worker", Duration::from_millis(20))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = h.manager.start(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    let report = h.manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.completed_items, 3);

    let items = h.checkpoints.list_items(&job.job_id).await.unwrap();
    let reclaimed = items.iter().find(|i| i.item_id == "nasa-1").unwrap();
    assert_eq!(reclaimed.state, ItemState::Succeeded);
    assert!(reclaimed.lease.is_none());
}

#[tokio::test]
async fn pools_draw_from_the_injected_rate_limiter() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    // Effectively no refill during the test, so consumption is observable.
    config.rate_limit = RateLimitConfig {
        permits_per_second: 0.01,
        burst: 5,
        acquire_timeout: Duration::from_secs(5),
    };

    let checkpoints = Arc::new(FileCheckpointStore::new(config.data_dir.clone()));
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let pool = WorkerPool::new(
        config,
        Arc::new(ScriptedRenderer::always_ok()),
        Arc::new(MemoryArtifactStore::new()),
        checkpoints.clone(),
        limiter.clone(),
        Arc::new(EngineMetrics::new()),
    );

    let mut job = Job::new(&spec(&["nasa"]));
    let items: Vec<Item> = (0..3)
        .map(|i| {
            Item::from_tweet(&Tweet {
                id: format!("nasa-{i}"),
                account: "nasa".to_string(),
                kind: ItemKind::Tweet,
                created_at: Utc::now(),
            })
        })
        .collect();
    job.total_items = items.len();
    checkpoints.create_job(&job, &items).await.unwrap();

    let run = pool.run(&mut job).await.unwrap();
    assert_eq!(run.completed, 3);

    // The three renders drew from the caller's bucket, not a private one.
    let available = limiter.available().await;
    assert!(available < 2.5, "expected depleted bucket, got {available}");
}

#[tokio::test]
async fn upload_failure_marks_item_failed_not_permanent() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let renderer = Arc::new(ScriptedRenderer::always_ok());
    let checkpoints = Arc::new(FileCheckpointStore::new(config.data_dir.clone()));
    let manager = JobManager::new(
        config,
        checkpoints.clone(),
        Arc::new(BrokenArtifactStore),
        renderer.clone(),
        Arc::new(StaticSource { per_account: 1 }),
    );

    let job = manager.create_job(&spec(&["nasa"])).await.unwrap();
    let status = manager.start(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Failed);

    // Renders succeeded but no artifact landed, so the item stays Failed
    // rather than PermanentlyFailed and a later run may retry it.
    let items = checkpoints.list_items(&job.job_id).await.unwrap();
    assert_eq!(items[0].state, ItemState::Failed);
    assert_eq!(items[0].attempt_count, 1);
    assert!(items[0].artifact_keys.is_empty());
}

#[tokio::test]
async fn missing_account_is_skipped_at_enumeration() {
    struct PartialSource;

    #[async_trait]
    impl TweetSource for PartialSource {
        async fn fetch_recent(
            &self,
            account: &str,
            _days_back: i64,
            _max: usize,
        ) -> Result<Vec<Tweet>, CaptureError> {
            if account == "ghost" {
                return Err(CaptureError::NotFound(format!("account {account}")));
            }
            Ok(vec![Tweet {
                id: format!("{account}-0"),
                account: account.to_string(),
                kind: ItemKind::Tweet,
                created_at: Utc::now(),
            }])
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let checkpoints = Arc::new(FileCheckpointStore::new(config.data_dir.clone()));
    let manager = JobManager::new(
        config,
        checkpoints,
        Arc::new(MemoryArtifactStore::new()),
        Arc::new(ScriptedRenderer::always_ok()),
        Arc::new(PartialSource),
    );

    let job = manager.create_job(&spec(&["nasa", "ghost"])).await.unwrap();
    assert_eq!(job.total_items, 1);

    let status = manager.start(&job.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);
}

#[tokio::test]
async fn invalid_job_specs_are_rejected() {
    let h = harness(ScriptedRenderer::always_ok(), 1);

    let empty = JobSpec {
        accounts: vec![],
        days_back: 7,
        max_tweets_per_account: 10,
        concurrency: None,
    };
    assert!(matches!(
        h.manager.create_job(&empty).await,
        Err(CaptureError::InvalidInput(_))
    ));

    let mut bad_concurrency = spec(&["nasa"]);
    bad_concurrency.concurrency = Some(0);
    assert!(matches!(
        h.manager.create_job(&bad_concurrency).await,
        Err(CaptureError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn unknown_job_ids_surface_as_not_found() {
    let h = harness(ScriptedRenderer::always_ok(), 1);

    assert!(matches!(
        h.manager.status("no-such-job").await,
        Err(CaptureError::JobNotFound(_))
    ));
    assert!(matches!(
        h.manager.start("no-such-job").await,
        Err(CaptureError::JobNotFound(_))
    ));
    assert_eq!(
        CaptureError::JobNotFound("no-such-job".to_string()).exit_code(),
        4
    );
}
