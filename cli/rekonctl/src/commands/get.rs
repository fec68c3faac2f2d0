//! Get command.

use anyhow::Result;
use clap::Args;
use rekon_controller::model::StoredSpec;
use rekon_controller::store::DesiredStateStore;
use rekon_id::ResourceName;

use crate::error::CliError;
use crate::output::{print_output, print_single, OutputFormat};

use super::{CommandContext, SpecRow, SpecView};

/// Show one spec.
#[derive(Debug, Args)]
pub struct GetCommand {
    /// Spec name.
    name: String,
}

impl GetCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let record = self.fetch(&ctx)?;

        match ctx.format {
            OutputFormat::Json => print_single(&SpecView::from(&record)),
            OutputFormat::Table => print_output(&[SpecRow::from(&record)], ctx.format),
        }
        Ok(())
    }

    fn fetch(&self, ctx: &CommandContext) -> Result<StoredSpec, CliError> {
        let name = ResourceName::parse(&self.name).map_err(rekon_controller::ValidationError::from)?;
        ctx.store()?
            .get(&name)?
            .ok_or_else(|| CliError::NotFound(self.name.clone()))
    }
}
