//! # Capture Engine
//!
//! A durable job execution engine that turns curated account handles into
//! archived tweet screenshots. A job enumerates recent tweets for each
//! account, renders every item in a headless browser, uploads the resulting
//! images to an artifact store, and checkpoints per-item progress so an
//! interrupted run resumes without redoing completed work.
//!
//! ## Design
//!
//! - **Claim-based workers**: items are claimed with a time-bounded lease
//!   before processing, so a crashed worker's items become reclaimable once
//!   the lease expires. Claims are atomic; no item is processed twice
//!   concurrently.
//! - **Retry with classification**: render failures are classified as
//!   transient, permanent, or unknown. Transient and unknown failures retry
//!   with exponential backoff; permanent ones fail the item immediately.
//! - **Profile fallback**: when the full-fidelity render profile exhausts its
//!   attempts on transient errors, degraded profiles are tried once each.
//! - **Durable checkpoints**: every state change is written atomically before
//!   it is acted on. The checkpoint store is the single source of truth on
//!   resume.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_engine::{CliRunner, Config, JobSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runner = CliRunner::new(Config::default())?;
//!
//!     let spec = JobSpec {
//!         accounts: vec!["nasa".to_string()],
//!         days_back: 7,
//!         max_tweets_per_account: 50,
//!         concurrency: None,
//!     };
//!     let job = runner.manager.create_job(&spec).await?;
//!     let status = runner.manager.start(&job.job_id).await?;
//!     println!("Job {} finished as {status}", job.job_id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # Capture a week of tweets for two accounts
//! capture-engine start-job --accounts nasa,esa --days-back 7
//!
//! # Inspect and resume an interrupted job
//! capture-engine status <job-id>
//! capture-engine resume <job-id>
//! ```

/// Configuration for workers, retries, rate limits, and stores
pub mod config;

/// Error types and retry classification
pub mod error;

/// Job, item, and lease records plus artifact key layout
pub mod job;

/// Retry policy: classification and backoff schedule
pub mod retry;

/// Token-bucket rate limiter shared by all workers
pub mod rate_limit;

/// Tweet enumeration for job creation
pub mod source;

/// Headless-browser rendering behind the `Renderer` trait
pub mod renderer;

/// Artifact storage for captured images
pub mod artifact;

/// Durable checkpoint store with atomic item claims
pub mod checkpoint;

/// Capture workers and the claim-based worker pool
pub mod worker;

/// Job lifecycle state machine
pub mod manager;

/// Engine metrics
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

#[cfg(test)]
mod tests;

pub use artifact::*;
pub use checkpoint::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use job::*;
pub use manager::*;
pub use metrics::*;
pub use rate_limit::*;
pub use renderer::*;
pub use retry::*;
pub use source::*;
pub use worker::*;
