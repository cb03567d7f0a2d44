//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the capture engine:
//! worker pool sizing, retry and rate-limit policy, lease and timeout budgets,
//! renderer profiles, and store locations.

use crate::error::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the capture engine
///
/// Controls worker concurrency, retry/backoff policy, rate limiting against
/// the external fetch API, crash-recovery lease budgets, and where durable
/// state and artifacts live.
///
/// # Examples
///
/// ```rust
/// use capture_engine::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     concurrency: 3,
///     max_retries: 5,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Number of concurrent capture workers (default: 4, clamped to CPU count)
    ///
    /// Renderer sessions are heavyweight; 3-5 is the useful range on a
    /// single host.
    pub concurrency: usize,

    /// Maximum render attempts per item before it is failed (default: 3)
    pub max_retries: usize,

    /// Exponential backoff settings applied between render attempts
    pub retry: RetryConfig,

    /// Token-bucket settings protecting the external fetch API
    pub rate_limit: RateLimitConfig,

    /// Wall-clock budget for a single item's render call (default: 180s)
    ///
    /// Distinct from the job's unbounded total runtime. Items that exceed it
    /// are treated as transient render timeouts.
    pub item_timeout: Duration,

    /// Lease duration on a claimed item (default: 300s)
    ///
    /// An item claimed but not checkpointed terminal within this window is
    /// reclaimable by any worker. Must exceed `item_timeout`.
    pub lease_ttl: Duration,

    /// How long a pausing pool waits for in-flight items (default: 60s)
    pub drain_timeout: Duration,

    /// Fraction of permanently failed items at which a fully-terminal job is
    /// marked Failed instead of Completed (default: 0.5)
    pub failure_threshold: f64,

    /// Number of upload attempts per artifact before the item fails (default: 3)
    pub upload_retries: usize,

    /// Directory holding job checkpoint documents (default: ./data)
    pub data_dir: PathBuf,

    /// Root directory of the filesystem artifact store (default: ./artifacts)
    pub artifact_dir: PathBuf,

    /// Output image format for captured pages (default: PNG)
    pub output_format: OutputFormat,

    /// Browser viewport used when rendering tweets
    pub viewport: Viewport,

    /// Ordered renderer configuration variants
    ///
    /// The first profile is full fidelity; later ones are progressively
    /// degraded fallbacks tried when the final configured attempt fails with
    /// a transient error.
    pub render_profiles: Vec<RenderProfile>,

    /// Base URL of the tweet enumeration endpoint
    pub source_base_url: String,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for renderer and source requests
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 4.min(num_cpus::get().max(1)),
            max_retries: 3,
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            item_timeout: Duration::from_secs(180),
            lease_ttl: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(60),
            failure_threshold: 0.5,
            upload_retries: 3,
            data_dir: PathBuf::from("./data"),
            artifact_dir: PathBuf::from("./artifacts"),
            output_format: OutputFormat::Png,
            viewport: Viewport::default(),
            render_profiles: vec![RenderProfile::full(), RenderProfile::minimal()],
            source_base_url: "https://cdn.syndication.twimg.com".to_string(),
            chrome_path: None,
            user_agent: None,
        }
    }
}

impl Config {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.concurrency == 0 {
            return Err(CaptureError::ConfigurationError(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(CaptureError::ConfigurationError(
                "max_retries must be greater than 0".to_string(),
            ));
        }
        if self.item_timeout.as_secs() == 0 {
            return Err(CaptureError::ConfigurationError(
                "item_timeout must be greater than 0".to_string(),
            ));
        }
        if self.lease_ttl < self.item_timeout {
            return Err(CaptureError::ConfigurationError(
                "lease_ttl must not be shorter than item_timeout".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(CaptureError::ConfigurationError(
                "failure_threshold must be within [0.0, 1.0]".to_string(),
            ));
        }
        if self.render_profiles.is_empty() {
            return Err(CaptureError::ConfigurationError(
                "at least one render profile is required".to_string(),
            ));
        }
        if url::Url::parse(&self.source_base_url).is_err() {
            return Err(CaptureError::ConfigurationError(format!(
                "source_base_url is not a valid URL: {}",
                self.source_base_url
            )));
        }
        Ok(())
    }
}

/// Exponential backoff settings for render retries
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Delay before the second attempt (default: 1s)
    pub initial_delay: Duration,

    /// Ceiling on any computed delay (default: 60s)
    pub max_delay: Duration,

    /// Per-attempt multiplier (default: 2.0)
    pub multiplier: f64,

    /// Apply up to ±20% jitter to each delay (default: true)
    ///
    /// Recommended when several workers share one renderer host.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Token-bucket rate limiter settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Sustained permits per second (default: 1)
    pub permits_per_second: f64,

    /// Bucket capacity, i.e. allowed burst (default: 5)
    pub burst: usize,

    /// How long a worker blocks waiting for a permit before the wait counts
    /// as a transient failure (default: 30s)
    pub acquire_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permits_per_second: 1.0,
            burst: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Browser viewport configuration for tweet rendering
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 1024)
    pub height: u32,

    /// Device pixel ratio for high-DPI output (default: 2.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 1024,
            device_scale_factor: 2.0,
            mobile: false,
        }
    }
}

/// One renderer configuration variant
///
/// Profiles are tried in order: the full-fidelity profile first, then the
/// degraded-but-working fallback once transient failures exhaust the
/// configured attempts.
///
/// # Examples
///
/// ```rust
/// use capture_engine::RenderProfile;
///
/// let primary = RenderProfile::full();
/// let fallback = RenderProfile::minimal();
/// assert!(primary.enable_javascript);
/// assert!(!fallback.wait_for_network_idle);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderProfile {
    /// Profile name used in logs and checkpoints
    pub name: String,

    /// Block image loading (minimal profile only)
    pub block_images: bool,

    /// Enable JavaScript execution
    pub enable_javascript: bool,

    /// Wait for network activity to settle before capturing
    pub wait_for_network_idle: bool,

    /// Extra settle time after load before the screenshot
    pub wait_after_load: Option<Duration>,
}

impl RenderProfile {
    /// Full-fidelity rendering: scripts, media, and a network-idle wait.
    pub fn full() -> Self {
        Self {
            name: "full".to_string(),
            block_images: false,
            enable_javascript: true,
            wait_for_network_idle: true,
            wait_after_load: Some(Duration::from_millis(1500)),
        }
    }

    /// Degraded rendering that trades fidelity for reliability.
    pub fn minimal() -> Self {
        Self {
            name: "minimal".to_string(),
            block_images: true,
            enable_javascript: true,
            wait_for_network_idle: false,
            wait_after_load: Some(Duration::from_millis(500)),
        }
    }
}

/// Supported output image formats for captured pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OutputFormat {
    /// PNG format - lossless compression, best quality
    Png,
    /// JPEG format - lossy compression, smaller files
    Jpeg,
    /// WebP format - modern compression, good balance of size and quality
    Webp,
}

/// Parameters of one capture run, supplied by the dispatcher
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSpec {
    /// Curated account handles, in dispatch order
    pub accounts: Vec<String>,

    /// How many days of history to enumerate per account
    pub days_back: i64,

    /// Upper bound on items enumerated per account
    pub max_tweets_per_account: usize,

    /// Optional per-job worker count override
    pub concurrency: Option<usize>,
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.accounts.is_empty() {
            return Err(CaptureError::InvalidInput(
                "at least one account is required".to_string(),
            ));
        }
        if self.accounts.iter().any(|a| a.trim().is_empty()) {
            return Err(CaptureError::InvalidInput(
                "account handles must be non-empty".to_string(),
            ));
        }
        if self.days_back <= 0 {
            return Err(CaptureError::InvalidInput(
                "days_back must be greater than 0".to_string(),
            ));
        }
        if self.max_tweets_per_account == 0 {
            return Err(CaptureError::InvalidInput(
                "max_tweets_per_account must be greater than 0".to_string(),
            ));
        }
        if self.concurrency == Some(0) {
            return Err(CaptureError::InvalidInput(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
