use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobber_core::QueryView;
use jobber_engine::{Jobber, JobberConfig};
use jobber_metrics::AppMetrics;
use jobber_scrape::Registry;
use jobber_store::Store;
use jobber_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Parser)]
#[command(name = "jobber")]
#[command(about = "Job searches as self-updating RSS feeds")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and the web frontend (the default).
    Serve,
    /// Scrape all sources once for a query and print a summary.
    Scrape { keywords: String, location: String },
    /// Apply the database schema and exit.
    Migrate,
}

#[derive(Debug, Clone)]
struct Config {
    database_url: String,
    log_file: Option<PathBuf>,
    initial_scrape_timeout: Option<Duration>,
}

impl Config {
    fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:jobber.sqlite".to_string()),
            log_file: std::env::var("JOBBER_LOG_FILE").ok().map(PathBuf::from),
            initial_scrape_timeout: std::env::var("JOBBER_INITIAL_SCRAPE_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_secs),
        }
    }

    fn jobber_config(&self) -> JobberConfig {
        let mut config = JobberConfig::default();
        if let Some(timeout) = self.initial_scrape_timeout {
            config.initial_scrape_timeout = timeout;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_logging(config.log_file.as_ref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Scrape { keywords, location } => scrape_once(keywords, location).await,
        Commands::Migrate => {
            Store::open(&config.database_url).await?;
            println!("migrations applied");
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let store = Arc::new(Store::open(&config.database_url).await?);
    let metrics = Arc::new(AppMetrics::new().context("registering metrics")?);
    let sources = Registry::production(metrics.clone());

    let jobber = Jobber::start(
        store.clone(),
        sources,
        metrics.clone(),
        config.jobber_config(),
    )
    .await?;

    let state = AppState {
        jobber: jobber.clone(),
        metrics,
    };
    jobber_web::serve(LISTEN_ADDR, state, shutdown_signal()).await?;

    // The listener stopped accepting work; cancel in-flight scrapes, drain
    // the scheduler, then close the pool.
    jobber.shutdown().await;
    store.close().await;

    Ok(())
}

async fn scrape_once(keywords: String, location: String) -> Result<()> {
    let metrics = Arc::new(AppMetrics::new().context("registering metrics")?);
    let sources = Registry::production(metrics);

    let now = Utc::now();
    let query = QueryView {
        id: 0,
        keywords: keywords.trim().to_ascii_lowercase(),
        location: location.trim().to_ascii_lowercase(),
        created_at: now,
        queried_at: now,
        updated_at: None,
        scraped_at: None,
    };

    let (offers, err) = sources
        .scrape_all(CancellationToken::new(), &query)
        .await;

    println!(
        "scrape complete: sources={} offers={}",
        sources.len(),
        offers.len()
    );
    for offer in &offers {
        println!("- [{}] {} ({})", offer.source, offer.title, offer.url);
    }
    if let Some(err) = err {
        println!("partial failure: {err}");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "unable to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutting down");
}

/// Structured logs: JSON lines at debug level when a log file is
/// configured, compact stderr output otherwise.
fn init_logging(log_file: Option<&PathBuf>) -> Result<()> {
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
                )
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .compact()
                .init();
        }
    }
    Ok(())
}
