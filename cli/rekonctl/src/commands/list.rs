//! List command.

use anyhow::Result;
use clap::Args;
use rekon_controller::store::DesiredStateStore;

use crate::output::{print_output, print_single, OutputFormat};

use super::{CommandContext, SpecRow, SpecView};

/// List all specs.
#[derive(Debug, Args)]
pub struct ListCommand {}

impl ListCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let records = ctx.store()?.list()?;

        match ctx.format {
            OutputFormat::Json => {
                let views: Vec<SpecView> = records.iter().map(SpecView::from).collect();
                print_single(&views);
            }
            OutputFormat::Table => {
                let rows: Vec<SpecRow> = records.iter().map(SpecRow::from).collect();
                print_output(&rows, ctx.format);
            }
        }
        Ok(())
    }
}
