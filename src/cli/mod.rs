//! Command-line interface for handover.
//!
//! # Commands
//!
//! - `check` - Report whether a newer release is available
//! - `update` - Download, verify and stage the latest release, then hand over
//!   to the successor
//! - `unpack` - Successor entry point: apply a staged blob
//! - `rollback` - Restore the version replaced by the last update
//! - `status` - Show the recorded update state
//!
//! # Global Options
//!
//! - `--verbose` / `--quiet` - Log level (`RUST_LOG` overrides both)
//! - `--config` - Configuration file (also `HANDOVER_CONFIG`)
//! - `--install-dir` - Installation to operate on (defaults to the directory
//!   holding this executable)
//! - `--no-progress` - Log download progress instead of drawing bars
//!
//! # Examples
//!
//! ```bash
//! handover check --prerelease
//! handover --verbose update
//! handover --install-dir /opt/launcher status
//! handover unpack --blob .handover/launcher_update.bin --resume
//! ```

pub mod check;
pub mod rollback;
pub mod status;
pub mod unpack;
pub mod update;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::UpdaterConfig;
use crate::constants::CONFIG_ENV_VAR;
use crate::layout::InstallLayout;
use crate::transport::HttpTransport;

/// Settings derived from the global flags, shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Console log level; `None` disables console logging.
    pub log_level: Option<String>,

    /// Log download progress instead of drawing progress bars.
    pub no_progress: bool,

    /// Explicit configuration file.
    pub config_path: Option<PathBuf>,

    pub install_dir: PathBuf,
}

impl CliConfig {
    #[must_use]
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            ..Self::default()
        }
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout::new(&self.install_dir)
    }

    /// Loads the updater configuration of the selected installation.
    pub async fn load(&self) -> Result<UpdaterConfig> {
        Ok(UpdaterConfig::load(&self.install_dir, self.config_path.as_deref()).await?)
    }

    /// HTTP transport authenticated with the configured token, if any.
    pub fn transport(&self, config: &UpdaterConfig) -> Result<HttpTransport> {
        let token = config.token_path(&self.install_dir);
        Ok(HttpTransport::from_token_file(token.as_deref())?)
    }

    /// Installs the global subscriber.
    ///
    /// `RUST_LOG` takes precedence over `log_level`. With `log_file`, every
    /// event at info level or above is also appended to that file.
    pub fn init_logging(&self, log_file: Option<&Path>) {
        let console = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(self.log_level.as_deref().unwrap_or("off"))
        };
        let console = fmt::layer().with_writer(std::io::stderr).with_target(false).with_filter(console);

        let file = log_file.and_then(|path| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok()?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
            let level = if self.log_level.as_deref() == Some("debug") { "debug" } else { "info" };
            Some(fmt::layer().with_writer(Arc::new(file)).with_ansi(false).with_filter(EnvFilter::new(level)))
        });

        if let Err(e) = tracing_subscriber::registry().with(console).with(file).try_init() {
            tracing::debug!("Logging already initialized: {}", e);
        }
    }
}

/// Self-updater for the launcher installation.
#[derive(Parser)]
#[command(
    name = "handover",
    about = "Self-updater for the launcher - resolve, download, verify and swap in a new release",
    version,
    long_about = "handover updates a launcher installation in two processes: the running launcher \
                  stages the release, then a successor process terminates it and swaps the files in \
                  atomically."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all log output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Installation directory to operate on
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a newer release is available
    Check(check::CheckCommand),

    /// Download the latest release and hand over to the successor
    Update(update::UpdateCommand),

    /// Apply a staged update blob (run by the successor)
    Unpack(unpack::UnpackCommand),

    /// Restore the version replaced by the last update
    Rollback(rollback::RollbackCommand),

    /// Show the recorded update state
    Status(status::StatusCommand),
}

fn default_install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        self.execute_with_config(config).await
    }

    /// Builds a [`CliConfig`] from the parsed global flags.
    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let log_level = if self.verbose {
            Some("debug".to_string())
        } else if self.quiet {
            None
        } else {
            Some("info".to_string())
        };

        CliConfig {
            log_level,
            no_progress: self.no_progress,
            config_path: self.config.clone(),
            install_dir: self.install_dir.clone().unwrap_or_else(default_install_dir),
        }
    }

    pub async fn execute_with_config(self, config: CliConfig) -> Result<()> {
        let log_file = match self.command {
            Commands::Unpack(_) => Some(config.layout().unpacker_log()),
            _ => None,
        };
        config.init_logging(log_file.as_deref());

        match self.command {
            Commands::Check(cmd) => cmd.execute(&config).await,
            Commands::Update(cmd) => cmd.execute(&config).await,
            Commands::Unpack(cmd) => cmd.execute(&config).await,
            Commands::Rollback(cmd) => cmd.execute(&config).await,
            Commands::Status(cmd) => cmd.execute(&config).await,
        }
    }
}
