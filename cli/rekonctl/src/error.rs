//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use rekon_controller::store::StoreError;
use rekon_controller::ValidationError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("spec not found: {0}")]
    NotFound(String),

    #[error("failed to open store {}: {source}", .path.display())]
    StoreOpen {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(e) => Self::Validation(e),
            other => Self::Store(other),
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::NotFound(_) => {
                eprintln!("\n{}", "Hint: Run `rekonctl list` to see known specs.".yellow());
            }
            CliError::StoreOpen { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Point --store (or REKON_STORE_PATH) at the daemon's store file."
                        .yellow()
                );
            }
            CliError::Validation(_) => {
                eprintln!("\n{}", "The spec was not stored.".yellow());
            }
            CliError::Store(_) => {}
        }
    }
}
