//! Delete command.

use anyhow::Result;
use clap::Args;
use rekon_controller::model::StoredSpec;
use rekon_controller::store::DesiredStateStore;
use rekon_id::ResourceName;
use serde::Serialize;

use crate::error::CliError;
use crate::output::{print_single, print_success, OutputFormat};

use super::CommandContext;

/// Delete a spec. Its instances are torn down by rekond.
#[derive(Debug, Args)]
pub struct DeleteCommand {
    /// Spec name.
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteReceipt {
    name: String,
    revision: u64,
    deleted: bool,
}

impl DeleteCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let record = self.delete(&ctx)?;

        match ctx.format {
            OutputFormat::Json => print_single(&DeleteReceipt {
                name: self.name,
                revision: record.revision,
                deleted: record.deleted,
            }),
            OutputFormat::Table => print_success(&format!(
                "spec {} marked for deletion; rekond terminates its instances",
                self.name
            )),
        }
        Ok(())
    }

    fn delete(&self, ctx: &CommandContext) -> Result<StoredSpec, CliError> {
        let name = ResourceName::parse(&self.name).map_err(rekon_controller::ValidationError::from)?;
        ctx.store()?
            .delete(&name)?
            .ok_or_else(|| CliError::NotFound(self.name.clone()))
    }
}
