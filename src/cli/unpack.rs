//! Successor entry point.
//!
//! Started by `handover update` from the staged copy of the executable. Logs
//! are appended to `.handover/unpacker.log` since the successor runs without a
//! console.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tracing::{error, info};

use super::CliConfig;
use crate::successor::{Successor, SuccessorOptions};

/// Command to apply a staged update blob.
#[derive(Args)]
pub struct UnpackCommand {
    /// Transfer blob to apply
    #[arg(long, value_name = "PATH")]
    pub blob: PathBuf,

    /// Skip the handoff with the running launcher
    #[arg(long)]
    pub resume: bool,

    /// Continue even if another process holds the update lock
    #[arg(long)]
    pub force: bool,
}

impl UnpackCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<()> {
        let config = cli.load().await?;
        let layout = cli.layout();
        let blob = if self.blob.is_absolute() { self.blob } else { layout.root().join(self.blob) };
        info!(version = env!("CARGO_PKG_VERSION"), "Successor started for {}", layout.root().display());

        let options = SuccessorOptions {
            blob,
            resume: self.resume,
            force_lock: self.force,
        };
        let outcome = match Successor::new(layout, config).run(&options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Update failed: {}", e);
                return Err(e.into());
            }
        };

        println!(
            "✅ Applied {} files and {} directories ({} bytes)",
            outcome.files, outcome.directories, outcome.bytes
        );
        if !outcome.backup_retained {
            println!("{}", "⚠️  The previous version could not be kept; rollback is unavailable".yellow());
        }
        if let Some(pid) = outcome.relaunched {
            info!(pid, "Launcher relaunched");
        }
        Ok(())
    }
}
