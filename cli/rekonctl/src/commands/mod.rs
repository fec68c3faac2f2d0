//! CLI commands.

mod apply;
mod delete;
mod get;
mod list;

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rekon_controller::document::DesiredDocument;
use rekon_controller::model::StoredSpec;
use rekon_controller::store::SqliteStore;
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::OutputFormat;

/// rekonctl - Submit and inspect desired state for rekond.
#[derive(Debug, Parser)]
#[command(name = "rekonctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Desired state store file shared with rekond.
    #[arg(
        long,
        global = true,
        env = "REKON_STORE_PATH",
        default_value = "/var/lib/rekon/desired.db"
    )]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a document and store it as the desired state of its spec.
    Apply(apply::ApplyCommand),

    /// Show one spec.
    Get(get::GetCommand),

    /// List all specs.
    List(list::ListCommand),

    /// Delete a spec. Its instances are torn down by rekond.
    Delete(delete::DeleteCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub fn run(self) -> Result<()> {
        let ctx = CommandContext {
            store_path: self.store,
            format: OutputFormat::from_flag(&self.format),
        };

        match self.command {
            Commands::Apply(cmd) => cmd.run(ctx),
            Commands::Get(cmd) => cmd.run(ctx),
            Commands::List(cmd) => cmd.run(ctx),
            Commands::Delete(cmd) => cmd.run(ctx),
            Commands::Version => {
                println!("rekonctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub store_path: PathBuf,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Open the store file.
    pub fn store(&self) -> Result<SqliteStore, CliError> {
        SqliteStore::open(&self.store_path).map_err(|source| CliError::StoreOpen {
            path: self.store_path.clone(),
            source,
        })
    }
}

/// A stored spec as printed by `get` and `list`.
#[derive(Debug, Clone, Serialize, Tabled)]
#[serde(rename_all = "camelCase")]
struct SpecRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Revision")]
    revision: u64,

    #[tabled(rename = "Replicas")]
    replicas: i64,

    #[tabled(rename = "Image")]
    image: String,

    #[tabled(rename = "Devices")]
    devices: u32,

    #[tabled(rename = "Volumes")]
    volumes: usize,

    #[tabled(rename = "State")]
    state: &'static str,

    #[tabled(rename = "Updated")]
    updated_at: DateTime<Utc>,
}

impl From<&StoredSpec> for SpecRow {
    fn from(record: &StoredSpec) -> Self {
        let template = &record.spec.template;
        Self {
            name: record.spec.name.to_string(),
            revision: record.revision,
            replicas: record.spec.replicas,
            image: template.image.clone(),
            devices: template.resources.device_count,
            volumes: template.volume_mounts.len(),
            state: if record.deleted { "Deleting" } else { "Active" },
            updated_at: record.updated_at,
        }
    }
}

/// Full JSON view of a stored spec.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpecView {
    revision: u64,
    template_hash: String,
    deleted: bool,
    updated_at: DateTime<Utc>,
    spec: DesiredDocument,
}

impl From<&StoredSpec> for SpecView {
    fn from(record: &StoredSpec) -> Self {
        Self {
            revision: record.revision,
            template_hash: record.template_hash.to_string(),
            deleted: record.deleted,
            updated_at: record.updated_at,
            spec: DesiredDocument::from(&record.spec),
        }
    }
}
