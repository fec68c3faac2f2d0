//! Apply command.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use rekon_controller::document::DesiredDocument;
use rekon_controller::store::{DesiredStateStore, PutResult};
use serde::Serialize;

use crate::error::CliError;
use crate::output::{print_info, print_single, print_success, OutputFormat};

use super::CommandContext;

/// Validate a document and store it as the desired state of its spec.
#[derive(Debug, Args)]
pub struct ApplyCommand {
    /// Document file path (JSON, YAML or TOML, picked by extension).
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    pub file: PathBuf,

    /// Validate only; do not write to the store.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplyReceipt {
    name: String,
    dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<u64>,
    changed: bool,
    replicas: i64,
}

impl ApplyCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let receipt = self.apply(&ctx)?;

        match ctx.format {
            OutputFormat::Json => print_single(&receipt),
            OutputFormat::Table => match receipt.revision {
                None => print_success(&format!(
                    "{} is valid ({} replicas)",
                    self.file.display(),
                    receipt.replicas
                )),
                Some(revision) if receipt.changed => print_success(&format!(
                    "spec {} configured (revision {revision})",
                    receipt.name
                )),
                Some(revision) => print_info(&format!(
                    "spec {} unchanged (revision {revision})",
                    receipt.name
                )),
            },
        }

        Ok(())
    }

    fn apply(&self, ctx: &CommandContext) -> Result<ApplyReceipt, CliError> {
        let spec = DesiredDocument::from_path(&self.file)?.into_spec()?;
        let name = spec.name.to_string();
        let replicas = spec.replicas;

        if self.dry_run {
            return Ok(ApplyReceipt {
                name,
                dry_run: true,
                revision: None,
                changed: false,
                replicas,
            });
        }

        let PutResult { revision, changed } = ctx.store()?.put(spec)?;
        Ok(ApplyReceipt {
            name,
            dry_run: false,
            revision: Some(revision),
            changed,
            replicas,
        })
    }
}
