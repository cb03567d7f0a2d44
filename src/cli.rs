use crate::artifact::FsArtifactStore;
use crate::checkpoint::FileCheckpointStore;
use crate::config::{Config, JobSpec};
use crate::error::CaptureError;
use crate::job::JobStatus;
use crate::manager::JobManager;
use crate::renderer::ChromiumRenderer;
use crate::source::HttpTweetSource;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "capture-engine")]
#[command(about = "Durable tweet capture job engine")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Number of concurrent capture workers")]
    pub concurrency: Option<usize>,

    #[arg(long, help = "Maximum render attempts per item")]
    pub max_retries: Option<usize>,

    #[arg(long, help = "Per-item render timeout in seconds")]
    pub item_timeout: Option<u64>,

    #[arg(long, help = "Checkpoint data directory")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, help = "Artifact output directory")]
    pub artifact_dir: Option<PathBuf>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Install the Prometheus metrics recorder")]
    pub metrics: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a capture job for a set of accounts and run it
    StartJob {
        #[arg(
            short,
            long,
            value_delimiter = ',',
            help = "Account handles to capture (comma separated)"
        )]
        accounts: Vec<String>,

        #[arg(long, default_value = "7", help = "Days of history per account")]
        days_back: i64,

        #[arg(long, default_value = "50", help = "Maximum tweets per account")]
        max_tweets: usize,

        #[arg(long, help = "Worker count override for this job")]
        job_concurrency: Option<usize>,

        #[arg(long, help = "Create the job without running it")]
        no_run: bool,
    },

    /// Show the status of a job
    Status {
        #[arg(help = "Job identifier")]
        job_id: String,

        #[arg(long, help = "Emit the full report as JSON")]
        json: bool,
    },

    /// Resume an interrupted or paused job from its checkpoints
    Resume {
        #[arg(help = "Job identifier")]
        job_id: String,
    },

    /// Cancel a job
    Cancel {
        #[arg(help = "Job identifier")]
        job_id: String,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

pub struct CliRunner {
    pub config: Config,
    pub manager: Arc<JobManager>,
}

impl CliRunner {
    pub fn new(config: Config) -> Result<Self, CaptureError> {
        config.validate()?;

        let checkpoints = Arc::new(FileCheckpointStore::new(config.data_dir.clone()));
        let artifacts = Arc::new(FsArtifactStore::new(config.artifact_dir.clone()));
        let renderer = Arc::new(ChromiumRenderer::new(config.clone()));
        let source = Arc::new(HttpTweetSource::new(
            &config.source_base_url,
            config.user_agent.as_deref(),
        )?);

        let manager = Arc::new(JobManager::new(
            config.clone(),
            checkpoints,
            artifacts,
            renderer,
            source,
        ));

        Ok(Self { config, manager })
    }

    pub async fn run(&self, command: Commands) -> Result<(), CaptureError> {
        match command {
            Commands::StartJob {
                accounts,
                days_back,
                max_tweets,
                job_concurrency,
                no_run,
            } => {
                self.run_start_job(
                    JobSpec {
                        accounts,
                        days_back,
                        max_tweets_per_account: max_tweets,
                        concurrency: job_concurrency,
                    },
                    no_run,
                )
                .await
            }
            Commands::Status { job_id, json } => self.run_status(&job_id, json).await,
            Commands::Resume { job_id } => self.run_resume(&job_id).await,
            Commands::Cancel { job_id } => self.run_cancel(&job_id).await,
            Commands::Validate { config } => validate_config_file(&config).await,
        }
    }

    async fn run_start_job(&self, spec: JobSpec, no_run: bool) -> Result<(), CaptureError> {
        let job = self.manager.create_job(&spec).await?;
        println!("Created job {}", job.job_id);
        println!(
            "  {} items across {} accounts",
            job.total_items,
            job.accounts.len()
        );

        if no_run {
            println!("  Job is queued; run `resume {}` to start it", job.job_id);
            return Ok(());
        }

        let status = self.manager.start(&job.job_id).await?;
        self.print_outcome(&job.job_id, status).await
    }

    async fn run_status(&self, job_id: &str, json: bool) -> Result<(), CaptureError> {
        let report = self.manager.status(job_id).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("Job {}", report.job_id);
        println!("  Status: {}", report.status);
        println!(
            "  Items: {} total, {} succeeded, {} failed",
            report.total_items, report.completed_items, report.failed_items
        );
        for item in &report.failed {
            let category = item
                .category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "  Failed: @{}/{} after {} attempts ({})",
                item.account, item.item_id, item.attempts, category
            );
        }
        Ok(())
    }

    async fn run_resume(&self, job_id: &str) -> Result<(), CaptureError> {
        info!("Resuming job {job_id}");
        let status = self.manager.resume(job_id).await?;
        self.print_outcome(job_id, status).await
    }

    async fn run_cancel(&self, job_id: &str) -> Result<(), CaptureError> {
        self.manager.cancel(job_id).await?;
        println!("Cancelled job {job_id}");
        Ok(())
    }

    async fn print_outcome(&self, job_id: &str, status: JobStatus) -> Result<(), CaptureError> {
        let report = self.manager.status(job_id).await?;
        println!("Job {job_id} finished as {status}");
        println!(
            "  {} succeeded, {} failed, {} total",
            report.completed_items, report.failed_items, report.total_items
        );
        if status == JobStatus::Failed {
            return Err(CaptureError::CaptureFailed(format!(
                "{} of {} items failed permanently",
                report.failed_items, report.total_items
            )));
        }
        Ok(())
    }
}

async fn validate_config_file(path: &PathBuf) -> Result<(), CaptureError> {
    let content = tokio::fs::read_to_string(path).await?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Concurrency: {}", config.concurrency);
    println!("  Max retries: {}", config.max_retries);
    println!("  Item timeout: {:?}", config.item_timeout);
    println!("  Lease TTL: {:?}", config.lease_ttl);
    println!("  Data dir: {}", config.data_dir.display());
    println!("  Artifact dir: {}", config.artifact_dir.display());
    println!(
        "  Render profiles: {}",
        config
            .render_profiles
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
