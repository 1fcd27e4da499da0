//! Plan Executor - Main Application Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use config::{ConfigLoader, LoggingConfig};
use std::{env, path::PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod app;
mod approvals;
mod scheduler;
mod session;

use app::Application;

#[derive(Debug, Parser)]
#[command(name = "plan-executor", version, about = "Runs planned chain operations with signing approvals")]
struct Cli {
    /// Configuration file, falls back to CONFIG_PATH or config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a default configuration to the config path and exit
    #[arg(long)]
    write_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file if it exists
    let dotenv_result = dotenv::dotenv();

    let config_path = cli
        .config
        .or_else(|| env::var("CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    if cli.write_example_config {
        ConfigLoader::create_example(&config_path).context("Failed to write example configuration")?;
        println!("Wrote example configuration to {}", config_path.display());
        return Ok(());
    }

    let (config, from_file) = if config_path.exists() {
        let config = ConfigLoader::load(&config_path).context("Failed to load configuration")?;
        (config, true)
    } else {
        let config = ConfigLoader::load_from_env().context("Failed to load configuration from environment")?;
        (config, false)
    };

    init_logging(&config.logging)?;

    match dotenv_result {
        Ok(path) => info!("Loaded environment variables from {}", path.display()),
        Err(e) if !e.not_found() => warn!("Could not load .env file: {}", e),
        Err(_) => {}
    }

    info!("Starting Plan Executor v{}", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!("Configuration loaded from: {}", config_path.display());
    } else {
        warn!(
            "No configuration file at {}, using defaults and environment",
            config_path.display()
        );
    }
    info!("Network: {}", config.chain.network);
    info!("Signer mode: {:?}", config.signer.mode);

    let mut app = Application::new(config)
        .await
        .context("Failed to create application")?;

    let shutdown = app.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to install CTRL+C signal handler: {}", e),
        }
    });

    info!("Application starting...");
    let result = app.run().await;
    app.shutdown().await?;

    if let Err(e) = result {
        error!("Application error: {}", e);
        return Err(e);
    }

    info!("Plan Executor shutdown complete");
    Ok(())
}

/// Initialize logging; RUST_LOG and LOG_FORMAT override the configured values
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone());
    let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| logging.format.clone());

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format.as_str() {
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("Failed to initialize pretty logging")?;
        }
        _ => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("Failed to initialize JSON logging")?;
        }
    }

    info!("Logging initialized");
    info!("Log level: {}", log_level);
    info!("Log format: {}", log_format);

    if log_level == "trace" || log_level == "debug" {
        warn!("Debug/trace logging enabled - may impact performance in production");
    }

    Ok(())
}
