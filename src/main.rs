// ABOUTME: Gateway entry point: config, logging, core bootstrap, HTTP server, shutdown
// ABOUTME: Starts the request timeout sweeper and the cron tick loop

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crosswire::{config::Config, runner::ProcessAgentRunner, server};
use crosswire_core::clock::{Clock, SystemClock};
use crosswire_core::cron::CronService;
use crosswire_core::dispatch::AgentDispatcher;
use crosswire_core::events::Observers;
use crosswire_core::paths;
use crosswire_core::requests::RequestRegistry;
use crosswire_core::store::{FileJobStore, FileRequestStore, JobStore, RequestStore};

#[derive(Debug, Parser)]
#[command(
    name = "crosswire",
    about = "Cross-session request registry and cron scheduler gateway"
)]
struct Cli {
    /// Path to the TOML config file (defaults to the XDG config location)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before they take the process down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC! Gateway crashed with the following error:");
        eprintln!("{}", panic_info);
        eprintln!("Backtrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    // Initialize logging: stderr plus a daily-rolled file in the data dir
    std::fs::create_dir_all(paths::log_dir()).ok();
    let file_appender = tracing_appender::rolling::daily(paths::log_dir(), "crosswire.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    tracing::info!("Starting crosswire gateway");

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::info!(
        workspace = %config.workspace.path,
        http_host = %config.http.host,
        http_port = config.http.port,
        runner_command = ?config.runner.command,
        "Configuration loaded"
    );

    let metrics_handle = Arc::new(crosswire_core::metrics::init_metrics()?);

    let workspace = PathBuf::from(&config.workspace.path);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let observers = Arc::new(Observers::new());

    let request_store: Arc<dyn RequestStore> =
        Arc::new(FileRequestStore::new(workspace.join("requests.json")));
    let job_store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(workspace.join("jobs.json")));

    let registry = Arc::new(
        RequestRegistry::load(
            request_store,
            Arc::clone(&clock),
            Arc::clone(&observers),
            config.requests.clone(),
        )
        .await,
    );

    let runner = ProcessAgentRunner::new(config.runner.clone());
    let dispatcher: Arc<dyn AgentDispatcher> = Arc::clone(&runner) as Arc<dyn AgentDispatcher>;
    let cron = Arc::new(
        CronService::load(
            job_store,
            dispatcher,
            clock,
            observers,
            config.cron.clone(),
        )
        .await,
    );

    Arc::clone(&registry).start_timeout_sweeper();
    Arc::clone(&cron).start();

    let state = server::AppState {
        registry: Arc::clone(&registry),
        cron: Arc::clone(&cron),
        runner,
        api_key: config.http.api_key.clone(),
        metrics_handle,
    };
    let app = server::router(state);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "HTTP API listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("HTTP server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cron.stop();
    registry.stop_timeout_sweeper();
    tracing::info!("Gateway stopped");
    Ok(())
}
