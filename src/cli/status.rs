//! Show the recorded update state.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::time::Duration;

use super::CliConfig;
use crate::backup::PreviousVersion;
use crate::core::StateError;
use crate::state::{UpdateLock, UpdateState, peek_state};

/// Command to print the state of the installation.
#[derive(Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<()> {
        let layout = cli.layout();
        let config = cli.load().await?;

        println!("Installation: {}", layout.root().display());
        println!("Installed version: {}", config.installed_version.bold());

        let lock_file = layout.lock_file();
        let state = peek_state(&lock_file)?;
        let label = match state {
            UpdateState::None => state.as_str().normal(),
            s if s.is_failure() => s.as_str().red(),
            s => s.as_str().yellow(),
        };
        println!("Update state: {label}");

        if lock_file.exists() {
            match UpdateLock::acquire_with_timeout(&lock_file, false, Duration::ZERO).await {
                Ok(lock) => lock.release(),
                Err(StateError::AlreadyLocked {
                    ..
                }) => println!("{}", "An update is in progress".yellow()),
                Err(e) => return Err(e.into()),
            }
        }

        if layout.blob().is_file() {
            println!("Staged blob: {}", layout.blob().display());
        }

        match PreviousVersion::new(layout.root()).manifest()? {
            Some(journal) => println!(
                "Previous version: available (update {} at {})",
                journal.id,
                journal.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => println!("Previous version: none"),
        }
        Ok(())
    }
}
