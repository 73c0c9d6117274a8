//! Update the installation to the latest release.
//!
//! Stages the release while the launcher keeps running, then starts the
//! successor. On success the successor terminates this process, so the command
//! only returns when there was nothing to install or the update failed; in
//! both cases the installed version keeps working.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use super::CliConfig;
use super::check::ReleaseArgs;
use crate::config::UpdaterConfig;
use crate::download::{IndicatifSink, ProgressSink, TracingSink};
use crate::pipeline::{Prepared, UpdateOptions, UpdatePipeline};

/// Command to download, stage and apply the latest release.
#[derive(Args)]
pub struct UpdateCommand {
    #[command(flatten)]
    release: ReleaseArgs,

    /// Only stage the update; do not start the successor
    #[arg(long)]
    no_handoff: bool,
}

impl UpdateCommand {
    pub fn options(&self, config: &UpdaterConfig) -> UpdateOptions {
        self.release.options(config)
    }

    pub async fn execute(self, cli: &CliConfig) -> Result<()> {
        let config = cli.load().await?;
        let transport = Arc::new(cli.transport(&config)?);
        let options = self.options(&config);

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling the update");
                flag.store(true, Ordering::SeqCst);
            }
        });

        let sink: Box<dyn ProgressSink> =
            if cli.no_progress { Box::new(TracingSink::default()) } else { Box::new(IndicatifSink::new()) };

        let mut pipeline = UpdatePipeline::new(cli.layout(), config, transport)
            .with_cancel_flag(cancel)
            .with_progress(sink)
            .with_config_path(cli.config_path.clone());

        println!("🔍 Checking for updates");
        let blob = match pipeline.prepare(&options).await? {
            Prepared::UpToDate {
                version,
            } => {
                println!("✅ Already up to date ({})", version.bold());
                return Ok(());
            }
            Prepared::Staged {
                version,
                blob,
                resumed,
            } => {
                if resumed {
                    println!("♻️  Resuming staged update");
                } else if let Some(version) = version {
                    println!("📥 Staged {}", version.green().bold());
                }
                blob
            }
        };

        if self.no_handoff {
            println!("Update staged at {}", blob.display());
            println!("{}", "Run `handover update` again to apply it".yellow());
            return Ok(());
        }

        println!("🔄 Handing over to the successor");
        Err(pipeline.hand_off(&blob).await.into())
    }
}
