use capture_engine::{
    install_prometheus_recorder, setup_logging, CaptureError, Cli, CliRunner, Config,
};
use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    if let Err(e) = setup_logging(args.verbose) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!("Starting capture-engine v{}", env!("CARGO_PKG_VERSION"));

    if args.metrics {
        if let Err(e) = install_prometheus_recorder() {
            error!("Failed to install metrics recorder: {e}");
            std::process::exit(1);
        }
    }

    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let runner = match CliRunner::new(config) {
        Ok(runner) => runner,
        Err(e) => {
            error!("Startup error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    // A signal pauses running pools so the run settles as resumable;
    // the runs themselves return through the normal path below.
    let _shutdown_handler = setup_shutdown_handler(runner.manager.clone());

    match runner.run(args.command).await {
        Ok(()) => {
            info!("capture-engine finished");
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn load_config(args: &Cli) -> Result<Config, CaptureError> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&content)?
    } else {
        Config::default()
    };

    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(timeout) = args.item_timeout {
        config.item_timeout = Duration::from_secs(timeout);
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(artifact_dir) = &args.artifact_dir {
        config.artifact_dir = artifact_dir.clone();
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!("Configuration loaded");
    info!("Worker concurrency: {}", config.concurrency);
    info!("Max retries per item: {}", config.max_retries);
    info!("Item timeout: {:?}", config.item_timeout);

    Ok(config)
}

fn setup_shutdown_handler(
    manager: std::sync::Arc<capture_engine::JobManager>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to create SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to create SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, pausing running jobs");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, pausing running jobs");
            }
        }

        manager.pause_all().await;
    })
}
