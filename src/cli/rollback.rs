//! Restore the version replaced by the last update.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use super::CliConfig;
use crate::backup::PreviousVersion;
use crate::state::UpdateLock;

/// Command to restore the retained previous version.
#[derive(Args)]
pub struct RollbackCommand {
    /// Continue even if another process holds the update lock
    #[arg(long)]
    force: bool,
}

impl RollbackCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<()> {
        let layout = cli.layout();
        let lock = UpdateLock::acquire(&layout.lock_file(), self.force).await?;

        let previous = PreviousVersion::new(layout.root());
        let id = previous.manifest()?.map(|journal| journal.id);
        previous.restore().await?;
        lock.clear()?;
        lock.release();

        match id {
            Some(id) => println!("✅ Restored the previous version (update {})", id.dimmed()),
            None => println!("✅ Restored the previous version"),
        }
        Ok(())
    }
}
