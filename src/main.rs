//! Task Graph Live
//!
//! HTTP API for a shared task graph, with change events pushed to
//! connected clients over WebSocket.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use task_graph_live::cli::{Cli, Command};
use task_graph_live::config::{Config, ConfigLoader};
use task_graph_live::db::{Database, seed};
use task_graph_live::logging::{self, LogTarget};
use task_graph_live::server::{AppState, start_server};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    let loader = ConfigLoader::load(cli.config.as_deref())?;
    if let Some(path) = loader.config_path() {
        info!("Loaded config from {}", path.display());
    }
    let mut config = loader.into_config();
    cli.apply_overrides(&mut config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Seed => run_seed(&config),
        Command::Serve => run_server(config).await,
    }
}

fn open_database(config: &Config) -> Result<Database> {
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::open(&config.server.db_path)
        .with_context(|| format!("opening database {}", config.server.db_path.display()))?;
    info!("Database: {:?}", config.server.db_path);
    Ok(db)
}

fn run_seed(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    if seed::seed_if_empty(&db)? {
        info!("Database seeded");
    } else {
        info!("Database already has users, nothing to seed");
    }
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    config.validate()?;

    info!(
        "Starting Task Graph Live v{} ({:?})",
        env!("CARGO_PKG_VERSION"),
        config.server.app_env
    );

    let db = Arc::new(open_database(&config)?);
    if config.server.should_seed() {
        if let Err(e) = seed::seed_if_empty(&db) {
            warn!("Seeding failed: {:#}", e);
        }
    }

    let state = AppState::new(db, &config);
    let handle = start_server(state, &config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    handle.shutdown().await;
    Ok(())
}
