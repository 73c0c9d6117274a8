//! Current-process update pipeline.
//!
//! [`UpdatePipeline::prepare`] does everything that can run while the launcher
//! is still in use: it resolves the release, downloads and verifies both
//! assets, transpiles the archive into the transfer blob and stages a copy of
//! this executable as the successor. [`UpdatePipeline::hand_off`] then starts
//! the successor and answers its handshake; the successor terminates this
//! process and applies the blob.
//!
//! Progress is recorded in the update lock file after every step, so a
//! restarted pipeline that finds a staged blob goes straight to the handoff.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backup::recover_installation;
use crate::config::UpdaterConfig;
use crate::core::{DownloadError, HandoffError, StateError, UpdateError};
use crate::download::{NullSink, ProgressSink, RequestExecutor, poll_until_complete};
use crate::handoff::{Finalizer, HandoffState, HandoffStatus};
use crate::layout::InstallLayout;
use crate::release::{ReleaseDescriptor, ReleaseResolver, Resolution, SelectionPolicy};
use crate::state::{UpdateLock, UpdateState};
use crate::transpile::Transpiler;
use crate::verification::ChecksumVerifier;

/// Per-run choices made on the command line.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub policy: SelectionPolicy,
    /// Release document to use instead of the release list.
    pub url: Option<String>,
    /// Continue when another process holds the update lock.
    pub force_lock: bool,
}

/// Result of [`UpdatePipeline::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// Nothing to install.
    UpToDate {
        version: String,
    },
    /// The blob is staged and the successor can be started.
    Staged {
        /// Release version, unknown when resuming an earlier run.
        version: Option<String>,
        blob: PathBuf,
        resumed: bool,
    },
}

/// Drives the update from the running launcher's side.
pub struct UpdatePipeline {
    layout: InstallLayout,
    config: UpdaterConfig,
    config_path: Option<PathBuf>,
    transport: Arc<dyn crate::transport::Transport>,
    cancel: Arc<AtomicBool>,
    sink: Box<dyn ProgressSink>,
    successor_source: Option<PathBuf>,
}

impl UpdatePipeline {
    pub fn new(
        layout: InstallLayout,
        config: UpdaterConfig,
        transport: Arc<dyn crate::transport::Transport>,
    ) -> Self {
        Self {
            layout,
            config,
            config_path: None,
            transport,
            cancel: Arc::new(AtomicBool::new(false)),
            sink: Box::new(NullSink),
            successor_source: None,
        }
    }

    /// Flag that aborts the downloads when set.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Configuration file passed on to the successor.
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Executable staged as the successor instead of the running one.
    pub fn with_successor_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.successor_source = Some(path.into());
        self
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    fn resolver(&self) -> ReleaseResolver {
        ReleaseResolver::new(
            Arc::clone(&self.transport),
            self.config.releases_url.clone(),
            self.config.asset_names(),
            self.config.installed_version.clone(),
        )
    }

    /// Resolves the release without touching the installation.
    pub async fn check(&self, options: &UpdateOptions) -> Result<Resolution, UpdateError> {
        let resolver = self.resolver();
        let resolution = match &options.url {
            Some(url) => resolver.resolve_url(url, options.policy).await?,
            None => resolver.resolve(options.policy).await?,
        };
        Ok(resolution)
    }

    /// Runs the whole update. Returns only when nothing had to be installed;
    /// after a successful handoff the successor terminates this process.
    pub async fn run(&mut self, options: &UpdateOptions) -> Result<String, UpdateError> {
        match self.prepare(options).await? {
            Prepared::UpToDate {
                version,
            } => Ok(version),
            Prepared::Staged {
                blob,
                ..
            } => Err(self.hand_off(&blob).await),
        }
    }

    /// Stages the update under the update lock, releasing it on return.
    pub async fn prepare(&mut self, options: &UpdateOptions) -> Result<Prepared, UpdateError> {
        let work_dir = self.layout.work_dir();
        tokio::fs::create_dir_all(&work_dir).await.map_err(|source| UpdateError::Io {
            operation: "create",
            path: work_dir.clone(),
            source,
        })?;

        let lock = UpdateLock::acquire(&self.layout.lock_file(), options.force_lock).await?;

        let report = recover_installation(self.layout.root())?;
        if !report.is_empty() {
            info!(
                discarded = report.discarded,
                rolled_back = report.rolled_back,
                completed = report.completed,
                "Recovered interrupted transactions"
            );
        }

        let previous = match lock.load() {
            Ok(state) => state,
            Err(StateError::Malformed {
                content,
                ..
            }) => {
                warn!("Ignoring unknown update state '{}'", content);
                UpdateState::None
            }
            Err(e) => return Err(e.into()),
        };
        debug!(state = %previous, "Loaded update state");

        let blob = self.layout.blob();
        if previous == UpdateState::Downloaded {
            if blob.is_file() {
                info!("Resuming staged update from {}", blob.display());
                self.stage_successor().await?;
                lock.release();
                return Ok(Prepared::Staged {
                    version: None,
                    blob,
                    resumed: true,
                });
            }
            warn!("Update state is 'downloaded' but {} is missing, starting over", blob.display());
        }

        let prepared = self.stage(&lock, options).await?;
        lock.release();
        Ok(prepared)
    }

    async fn stage(&mut self, lock: &UpdateLock, options: &UpdateOptions) -> Result<Prepared, UpdateError> {
        lock.store(UpdateState::Init)?;

        let resolution = match self.check(options).await {
            Ok(resolution) => resolution,
            Err(e) => {
                lock.store(UpdateState::BadUrl)?;
                return Err(e);
            }
        };
        let release = match resolution {
            Resolution::UpToDate {
                version,
            } => {
                lock.clear()?;
                return Ok(Prepared::UpToDate {
                    version,
                });
            }
            Resolution::Candidate(release) => release,
        };
        lock.store(UpdateState::Ready)?;
        info!(version = %release.version, "Downloading update");

        let archive = self.layout.download(&self.config.archive_asset);
        let executor = RequestExecutor::start(Arc::clone(&self.transport));
        let downloaded = self.download_assets(&executor, &release, &archive).await;
        executor.stop().await;
        let checksum = downloaded?;

        if let Err(e) = ChecksumVerifier::verify_checksum(&archive, &checksum).await {
            lock.store(UpdateState::InvalidState)?;
            if let Err(remove) = tokio::fs::remove_file(&archive).await {
                debug!("Unable to remove rejected archive {}: {}", archive.display(), remove);
            }
            return Err(e.into());
        }

        let blob = self.layout.blob();
        let transpiler = Transpiler::new(self.config.launcher_exe.clone())
            .with_layout(self.config.blob_layout());
        let (source, target, extract) = (archive.clone(), blob.clone(), self.layout.extract_dir());
        let report = tokio::task::spawn_blocking(move || transpiler.transpile(&source, &target, &extract))
            .await
            .map_err(|e| UpdateError::Io {
                operation: "transpile",
                path: archive.clone(),
                source: std::io::Error::other(e),
            })??;
        info!(entries = report.entries.len(), bytes = report.total_bytes(), "Update blob staged");

        lock.store(UpdateState::Downloaded)?;
        self.stage_successor().await?;

        Ok(Prepared::Staged {
            version: Some(release.version),
            blob,
            resumed: false,
        })
    }

    async fn download_assets(
        &mut self,
        executor: &RequestExecutor,
        release: &ReleaseDescriptor,
        archive: &Path,
    ) -> Result<String, DownloadError> {
        let checksum = executor.download_string(
            &self.config.checksum_asset,
            &release.checksum_url,
            Arc::clone(&self.cancel),
        )?;
        let file = executor.download_file(
            &self.config.archive_asset,
            &release.archive_url,
            archive,
            Arc::clone(&self.cancel),
        )?;

        let monitors = [checksum.monitor(), file.monitor()];
        let (checksum, size) = poll_until_complete(
            futures::future::try_join(checksum, file),
            &monitors,
            self.sink.as_mut(),
            self.config.poll_interval(),
        )
        .await?;

        debug!(size, "Archive downloaded to {}", archive.display());
        Ok(checksum)
    }

    async fn stage_successor(&self) -> Result<(), UpdateError> {
        let source = match &self.successor_source {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|source| UpdateError::Io {
                operation: "locate",
                path: PathBuf::from("current executable"),
                source,
            })?,
        };
        let target = self.layout.successor_exe();

        tokio::fs::copy(&source, &target).await.map_err(|source| UpdateError::Io {
            operation: "stage successor",
            path: target.clone(),
            source,
        })?;
        debug!("Staged successor {}", target.display());
        Ok(())
    }

    fn successor_command(&self, blob: &Path) -> Command {
        let mut command = Command::new(self.layout.successor_exe());
        command
            .arg("unpack")
            .arg("--blob")
            .arg(blob)
            .arg("--install-dir")
            .arg(self.layout.root());
        if let Some(config) = &self.config_path {
            command.arg("--config").arg(config);
        }
        command
            .current_dir(self.layout.root())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Starts the successor and answers its handshake, then waits to be
    /// terminated. Only returns on failure.
    ///
    /// A retryable failure restarts the handoff with a fresh channel and
    /// successor, up to the configured number of attempts.
    pub async fn hand_off(&self, blob: &Path) -> UpdateError {
        let config = self.config.handoff_config();
        let attempts = self.config.handoff.attempts.max(1);

        let mut attempt = 1;
        loop {
            let result = match Finalizer::start(config.clone(), self.successor_command(blob)) {
                Ok(mut finalizer) => self.drive(&mut finalizer).await.map(|()| finalizer),
                Err(e) => Err(e),
            };

            match result {
                Ok(mut finalizer) => {
                    info!("Handoff complete, waiting for the successor to take over");
                    return finalizer.wait_for_termination(&self.cancel).await.into();
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, "Handoff failed, retrying: {}", e);
                    attempt += 1;
                }
                Err(e) => return e.into(),
            }
        }
    }

    async fn drive(&self, finalizer: &mut Finalizer) -> Result<(), HandoffError> {
        let mut pending = 0;
        loop {
            match finalizer.resume().await? {
                HandoffStatus::WaitingForTermination => return Ok(()),
                HandoffStatus::Pending if pending < self.config.handoff.pending_retries => {
                    pending += 1;
                    debug!(pending, state = ?finalizer.state(), "Handoff pending");
                }
                HandoffStatus::Pending => {
                    return Err(match finalizer.state() {
                        HandoffState::AwaitingConnection => HandoffError::ConnectTimeout {
                            name: self.config.handoff.channel_name.clone(),
                        },
                        _ => HandoffError::ReadTimeout {
                            expected: "successor message",
                        },
                    });
                }
            }
        }
    }
}
