//! handover CLI entry point
//!
//! Parses the command line, runs the selected command and turns failures into
//! a colored error message with a suggestion.
//!
//! - `check` - Report whether a newer release is available
//! - `update` - Stage the latest release and hand over to the successor
//! - `unpack` - Apply a staged update (successor side)
//! - `rollback` - Restore the previous version
//! - `status` - Show the update state

use anyhow::Result;
use clap::Parser;
use handover::cli;
use handover::core::user_friendly_error;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Set up colored output for Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    match cli.execute().await {
        Ok(()) => Ok(()),
        Err(e) => {
            let error_ctx = user_friendly_error(e);
            error_ctx.display();
            std::process::exit(1);
        }
    }
}
