//! # TabReport — Scheduled Tableau report delivery
//!
//! Usage:
//!   tabreport                        # Serve the API and run the scheduler
//!   tabreport serve --port 8080      # Custom port
//!   tabreport run-once               # Run every due schedule once and exit
//!   tabreport init                   # Write ~/.tabreport/config.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tabreport_channels::{ArtifactStore, ChannelSet};
use tabreport_core::ReportConfig;
use tabreport_core::config::expand_path;
use tabreport_gateway::AppState;
use tabreport_scheduler::{ScheduleStore, SchedulerEngine, SqliteDatasetSource};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tabreport",
    version,
    about = "📊 TabReport — scheduled Tableau reports over email and WhatsApp"
)]
struct Cli {
    /// Config file (default: ~/.tabreport/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the scheduler loop
    Serve {
        /// Override the gateway port
        #[arg(short, long)]
        port: Option<u16>,

        /// Only serve the API; do not run schedules
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Run every due schedule once, then exit
    RunOnce,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let filter = if cli.verbose {
        "tabreport=debug,tabreport_scheduler=debug,tabreport_channels=debug,tower_http=debug"
    } else {
        "tabreport=info,tabreport_scheduler=info,tabreport_channels=info,tabreport_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(ReportConfig::default_path);

    match cli.command.unwrap_or(Command::Serve {
        port: None,
        no_scheduler: false,
    }) {
        Command::Init { force } => init(&config_path, force),
        Command::RunOnce => {
            let config = load_config(&config_path)?;
            let engine = build_engine(&config)?;
            let runs = engine.run_due(chrono::Utc::now()).await?;
            tracing::info!("✅ run-once finished: {} schedule(s) ran", runs.len());
            for run in &runs {
                tracing::info!(
                    "  {} → {} ({} delivered{})",
                    run.job_id,
                    run.outcome.as_str(),
                    run.delivered,
                    run.error
                        .as_deref()
                        .map(|e| format!(", {e}"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Serve { port, no_scheduler } => {
            let mut config = load_config(&config_path)?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            serve(config, no_scheduler).await
        }
    }
}

fn init(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    ReportConfig::default()
        .save_to(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("📝 Wrote default config to {}", path.display());
    Ok(())
}

fn load_config(path: &std::path::Path) -> Result<ReportConfig> {
    let mut config = if path.exists() {
        ReportConfig::load_from(path)?
    } else {
        tracing::info!("No config at {}, using defaults", path.display());
        ReportConfig::default()
    };
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

fn open_store(config: &ReportConfig) -> Result<Arc<ScheduleStore>> {
    let db_path = expand_path(&config.storage.db_path);
    let store = ScheduleStore::open(&db_path)
        .with_context(|| format!("opening schedule store {}", db_path.display()))?;
    tracing::info!("🗄️ Schedule store: {}", db_path.display());
    Ok(Arc::new(store))
}

fn build_engine(config: &ReportConfig) -> Result<Arc<SchedulerEngine>> {
    let store = open_store(config)?;
    engine_for(config, store)
}

fn engine_for(config: &ReportConfig, store: Arc<ScheduleStore>) -> Result<Arc<SchedulerEngine>> {
    let source = Arc::new(SqliteDatasetSource::new(expand_path(
        &config.storage.datasets_db,
    )));
    let channels = ChannelSet::from_config(config)?;
    if channels.is_empty() {
        tracing::warn!("⚠️ No delivery channel is enabled; every run will fail to deliver");
    }
    Ok(Arc::new(
        SchedulerEngine::new(store, source, channels, config.scheduler.clone())
            .with_artifacts(ArtifactStore::from_config(&config.artifacts)),
    ))
}

async fn serve(config: ReportConfig, no_scheduler: bool) -> Result<()> {
    let store = open_store(&config)?;
    let reports_dir: PathBuf = ArtifactStore::from_config(&config.artifacts).dir().to_path_buf();
    std::fs::create_dir_all(&reports_dir)
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let scheduler = if no_scheduler {
        tracing::info!("Scheduler disabled (--no-scheduler)");
        None
    } else {
        Some(engine_for(&config, store.clone())?.start())
    };

    let state = AppState::new(store, reports_dir);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("⚠️ Could not listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("🛑 Shutdown requested");
    };
    let served = tabreport_gateway::start(&config.gateway, state, shutdown).await;

    if let Some(handle) = scheduler {
        handle.stop().await;
    }
    served
}
