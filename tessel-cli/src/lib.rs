//! Shared pieces of the `tessel` command-line client.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tessel_store::{ChangeOrigin, FieldKind, Schema, StoreChange};
use tessel_sync::SyncConfig;

#[derive(Parser, Debug)]
#[command(name = "tessel")]
#[command(about = "Connect to a Tessel collaboration and inspect its store")]
pub struct Cli {
    /// Datastore service endpoint
    #[arg(long, env = "TESSEL_URL", default_value = "ws://localhost:8888/api/datastore")]
    pub url: String,

    /// Collaboration to join
    #[arg(short, long, env = "TESSEL_COLLABORATION")]
    pub collaboration: Option<String>,

    /// Access token sent with the connection
    #[arg(long, env = "TESSEL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// JSON file describing the store's tables
    #[arg(short, long, env = "TESSEL_SCHEMAS")]
    pub schemas: PathBuf,

    /// Checkpoint to start history replay from
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Deadline for each request in milliseconds; 0 waits indefinitely
    #[arg(long, default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Replay history and print the store as JSON
    Dump {
        /// Indent the output
        #[arg(long)]
        pretty: bool,
    },
    /// Stay connected and print every change as it arrives
    Watch,
}

impl Cli {
    /// Sync settings for these flags.
    pub fn sync_config(&self, schemas: Vec<Schema>) -> SyncConfig {
        SyncConfig {
            service_url: self.url.clone(),
            collaboration_id: self.collaboration.clone(),
            token: self.token.clone(),
            request_timeout_ms: self.request_timeout_ms,
            checkpoint_id: self.checkpoint.clone(),
            schemas,
            ..SyncConfig::default()
        }
    }
}

/// Reads a schema file.
pub fn load_schemas(path: &Path) -> Result<Vec<Schema>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema file {}", path.display()))?;
    parse_schemas(&text).with_context(|| format!("invalid schema file {}", path.display()))
}

/// Parses schemas from JSON.
///
/// Two layouts are accepted: a list of `{"id", "fields"}` objects, or an
/// object mapping each table name to its `{field: kind}` map.
pub fn parse_schemas(text: &str) -> Result<Vec<Schema>> {
    let value: Value = serde_json::from_str(text)?;
    let schemas: Vec<Schema> = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        Value::Object(_) => {
            let tables: BTreeMap<String, BTreeMap<String, FieldKind>> =
                serde_json::from_value(value)?;
            tables
                .into_iter()
                .map(|(name, fields)| {
                    fields
                        .into_iter()
                        .fold(Schema::new(name), |schema, (field, kind)| {
                            schema.with_field(field, kind)
                        })
                })
                .collect()
        }
        _ => bail!("expected a list or an object of tables"),
    };
    if schemas.is_empty() {
        bail!("no tables declared");
    }
    Ok(schemas)
}

/// One-line summary of a committed change.
pub fn describe_change(change: &StoreChange) -> String {
    let origin = match change.origin {
        ChangeOrigin::Local => "local",
        ChangeOrigin::Remote => "remote",
    };
    let fields: Vec<String> = change
        .fields
        .iter()
        .flat_map(|(schema, records)| {
            records.iter().flat_map(move |(record, fields)| {
                fields
                    .keys()
                    .map(move |field| format!("{schema}/{record}/{field}"))
            })
        })
        .collect();
    format!(
        "{origin} {} from store {}: {}",
        change.transaction_id,
        change.store_id,
        fields.join(", ")
    )
}
