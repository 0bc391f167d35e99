//! Tessel command-line client
//!
//! Joins a collaboration, replays its history into an in-memory store and
//! either prints the result or keeps following the change stream.
//!
//! Usage:
//!   tessel --collaboration nb --schemas tables.json dump --pretty
//!   tessel --collaboration nb --schemas tables.json watch

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tessel_cli::{Cli, Command, describe_change, load_schemas};
use tessel_sync::{ManagerEvent, SyncManager, WebSocketConnector};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let schemas = load_schemas(&cli.schemas)?;
    info!(tables = schemas.len(), url = %cli.url, "connecting");
    let manager = SyncManager::connect(cli.sync_config(schemas), Arc::new(WebSocketConnector))
        .await
        .context("failed to join the collaboration")?;
    info!(
        store_id = %manager.store_id(),
        serial = manager.server_serial(),
        "store is current"
    );

    let outcome = match cli.command {
        Command::Dump { pretty } => dump(&manager, pretty),
        Command::Watch => watch(&manager).await,
    };
    manager.close();
    outcome
}

fn dump(manager: &SyncManager, pretty: bool) -> Result<()> {
    let snapshot = manager.store().snapshot();
    let text = if pretty {
        serde_json::to_string_pretty(&snapshot)?
    } else {
        serde_json::to_string(&snapshot)?
    };
    println!("{text}");
    Ok(())
}

async fn watch(manager: &SyncManager) -> Result<()> {
    let _changes = manager
        .store()
        .on_change(|change| println!("{}", describe_change(change)));
    let mut events = manager.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ManagerEvent::Fatal { reason }) => bail!("sync stopped: {reason}"),
                Ok(ManagerEvent::Disconnected) => warn!("connection lost; reconnecting"),
                Ok(ManagerEvent::Stable { serial }) => info!(serial, "stable point"),
                Ok(event) => info!(?event, "sync event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed sync events"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
