//! lmsync-import - LMS to repository import service
//!
//! Subcommands:
//! - `run`: execute one import run and print its report
//! - `schedule --every <secs>`: run on a fixed interval until interrupted
//! - `serve --bind <addr>`: HTTP surface (health, runs, events)
//! - `configure --endpoint <url>`: persist the LMS endpoint

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lmsync_common::config::{
    config_file_path, load_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig,
};
use lmsync_common::events::{EventBus, RunState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lmsync_import::config::{load_lms_config, save_lms_endpoint, RunConfig, MODULE_NAME};
use lmsync_import::services::{run_on_schedule, RunController, RunError, WebhookNotifier};
use lmsync_import::AppState;

/// Command-line arguments for lmsync-import
#[derive(Parser, Debug)]
#[command(name = "lmsync-import")]
#[command(about = "Import LMS course material into the record repository")]
#[command(version)]
struct Args {
    /// Root folder holding the database
    #[arg(short, long, global = true)]
    root_folder: Option<PathBuf>,

    /// TOML config file (defaults to the platform config dir)
    #[arg(short, long, global = true, env = "LMSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one import run and print the report as JSON
    Run,

    /// Run imports on a fixed interval
    Schedule {
        /// Seconds between run starts
        #[arg(long, default_value = "3600")]
        every: u64,
    },

    /// Store the LMS endpoint in the database and the TOML config
    Configure {
        #[arg(long)]
        endpoint: String,
    },

    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:5780", env = "LMSYNC_BIND")]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let toml_path = args.config.clone().or_else(|| config_file_path(MODULE_NAME));
    let toml_config = match load_config(toml_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("lmsync-import: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| toml_config.logging.level.clone().into()),
        )
        // stdout carries the run report
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run_command(args, toml_config, toml_path).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<TomlConfig> {
    match path {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(TomlConfig::default()),
    }
}

async fn run_command(
    args: Args,
    toml_config: TomlConfig,
    toml_path: Option<PathBuf>,
) -> Result<ExitCode> {
    info!("Starting {} v{}", MODULE_NAME, env!("CARGO_PKG_VERSION"));

    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder)
        .with_toml_config(&toml_config)
        .resolve();

    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let pool = lmsync_import::db::init_database_pool(&db_path).await?;

    if let Command::Configure { endpoint } = &args.command {
        let toml_path = toml_path.context("No config file location available on this platform")?;
        save_lms_endpoint(&pool, endpoint.clone(), &toml_path).await?;
        info!("LMS endpoint saved");
        return Ok(ExitCode::SUCCESS);
    }

    let lms_config = load_lms_config(&pool, &toml_config).await?;
    let run_config = RunConfig::from_toml(&toml_config);
    let event_bus = EventBus::new(256);
    let mut controller = RunController::from_config(
        pool.clone(),
        &lms_config,
        run_config.clone(),
        event_bus.clone(),
    )
    .context("Failed to create LMS client")?;

    if let Some(url) = &run_config.failure_webhook {
        let notifier = WebhookNotifier::new(url, lms_config.request_timeout)
            .context("Invalid failure webhook")?;
        controller = controller.with_notifier(Arc::new(notifier));
        info!("Failed runs will be reported to {}", url);
    }

    match args.command {
        Command::Run => run_once(&controller).await,
        Command::Schedule { every } => {
            run_scheduled(&controller, Duration::from_secs(every.max(1))).await
        }
        Command::Configure { .. } => Ok(ExitCode::SUCCESS),
        Command::Serve { bind } => {
            let app = lmsync_import::build_router(AppState::new(pool, event_bus, controller));
            let listener = tokio::net::TcpListener::bind(bind).await?;
            info!("Listening on http://{}", bind);
            info!("Health check: http://{}/health", bind);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// One run; the report goes to stdout, the exit code reflects the state
async fn run_once(controller: &RunController) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Interrupt received, cancelling after the current item");
        on_signal.cancel();
    });

    let report = match controller.run_with_cancel(cancel).await {
        Ok(report) => report,
        Err(e @ RunError::RunInProgress) => {
            error!("{}", e);
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(e.into()),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(match report.state {
        RunState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Scheduled job loop; an interrupt cancels the in-flight run after its
/// current item and then stops the loop
async fn run_scheduled(controller: &RunController, every: Duration) -> Result<ExitCode> {
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Interrupt received, cancelling after the current item");
        on_signal.cancel();
    });

    run_on_schedule(controller, every, shutdown).await;
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for interrupt: {}", e);
        std::future::pending::<()>().await;
    }
}
