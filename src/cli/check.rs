//! Check whether a newer release is available.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;

use super::CliConfig;
use crate::config::UpdaterConfig;
use crate::pipeline::{UpdateOptions, UpdatePipeline};
use crate::release::{Resolution, SelectionPolicy};

/// Release selection flags shared by `check` and `update`.
#[derive(Args, Debug, Clone, Default)]
pub struct ReleaseArgs {
    /// Consider pre-releases
    #[arg(long)]
    pub prerelease: bool,

    /// Select the latest release even when it is not newer
    #[arg(long)]
    pub force: bool,

    /// Use this release document instead of the release list
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,
}

impl ReleaseArgs {
    pub fn options(&self, config: &UpdaterConfig) -> UpdateOptions {
        UpdateOptions {
            policy: SelectionPolicy {
                allow_prerelease: self.prerelease || config.allow_prerelease,
                force: self.force,
            },
            url: self.url.clone(),
            force_lock: false,
        }
    }
}

/// Command to report the release an update would install.
#[derive(Args)]
pub struct CheckCommand {
    #[command(flatten)]
    release: ReleaseArgs,
}

impl CheckCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<()> {
        let config = cli.load().await?;
        let transport = Arc::new(cli.transport(&config)?);
        let options = self.release.options(&config);
        let installed = config.installed_version.clone();

        let pipeline = UpdatePipeline::new(cli.layout(), config, transport);
        match pipeline.check(&options).await? {
            Resolution::UpToDate {
                version,
            } => {
                println!("✅ {} is up to date (latest: {})", installed.bold(), version);
            }
            Resolution::Candidate(release) => {
                let kind = if release.prerelease { " (pre-release)" } else { "" };
                println!(
                    "📦 Update available: {} → {}{}",
                    installed,
                    release.version.green().bold(),
                    kind.yellow()
                );
                println!("   archive:  {}", release.archive_url);
                println!("   checksum: {}", release.checksum_url);
            }
        }
        Ok(())
    }
}
