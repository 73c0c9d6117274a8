//! Updater configuration.
//!
//! Settings come from a TOML file. The file is looked up in this order:
//!
//! 1. `--config <PATH>` or the `HANDOVER_CONFIG` environment variable
//! 2. `handover.toml` in the installation directory
//! 3. built-in defaults
//!
//! Every field is optional. Command line flags override the loaded values.
//!
//! ```toml
//! releases_url = "https://api.github.com/repos/owner/launcher/releases"
//! installed_version = "v1.4.0"
//! checksum_asset = "hash.txt"
//! archive_asset = "Launcher.zip"
//! launcher_exe = "Launcher.exe"
//! token_file = ".handover/github_token"
//! allow_prerelease = false
//!
//! [handoff]
//! channel_name = "handover_launcher_updater"
//! connect_attempts = 10
//! pending_retries = 5
//! attempts = 2
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::blob::BlobLayout;
use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_ARCHIVE_ASSET, DEFAULT_CHANNEL_NAME, DEFAULT_CHECKSUM_ASSET,
    DEFAULT_LAUNCHER_EXE, DEFAULT_RELEASES_URL, DOWNLOAD_POLL_INTERVAL_MS,
    HANDOFF_ATTEMPTS, HANDOFF_CONNECT_ATTEMPTS, HANDOFF_PENDING_RETRIES,
};
use crate::core::ConfigError;
use crate::handoff::HandoffConfig;
use crate::release::AssetNames;

fn default_releases_url() -> String {
    DEFAULT_RELEASES_URL.to_string()
}

fn default_installed_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_checksum_asset() -> String {
    DEFAULT_CHECKSUM_ASSET.to_string()
}

fn default_archive_asset() -> String {
    DEFAULT_ARCHIVE_ASSET.to_string()
}

fn default_launcher_exe() -> String {
    DEFAULT_LAUNCHER_EXE.to_string()
}

const fn default_poll_interval_ms() -> u64 {
    DOWNLOAD_POLL_INTERVAL_MS
}

const fn default_true() -> bool {
    true
}

/// Settings of the handoff between the two processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffSettings {
    /// Well-known name of the channel.
    pub channel_name: String,
    /// Connection attempts made by the successor.
    pub connect_attempts: usize,
    /// `Pending` results tolerated by the current process.
    pub pending_retries: u32,
    /// Handoffs the current process starts before giving up.
    pub attempts: u32,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            connect_attempts: HANDOFF_CONNECT_ATTEMPTS,
            pending_retries: HANDOFF_PENDING_RETRIES,
            attempts: HANDOFF_ATTEMPTS,
        }
    }
}

/// Complete updater configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Release-list endpoint.
    #[serde(default = "default_releases_url")]
    pub releases_url: String,

    /// Version of the installed launcher.
    #[serde(default = "default_installed_version")]
    pub installed_version: String,

    #[serde(default = "default_checksum_asset")]
    pub checksum_asset: String,

    #[serde(default = "default_archive_asset")]
    pub archive_asset: String,

    /// Executable that must be present in every update archive and is
    /// relaunched after the update.
    #[serde(default = "default_launcher_exe")]
    pub launcher_exe: String,

    /// File holding an API bearer token. Relative paths are resolved against
    /// the installation directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,

    #[serde(default)]
    pub allow_prerelease: bool,

    /// Write blobs in the legacy untagged layout.
    #[serde(default)]
    pub legacy_blob: bool,

    /// Start the launcher after a successful update.
    #[serde(default = "default_true")]
    pub relaunch: bool,

    /// Interval of the download polling loop, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub handoff: HandoffSettings,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            releases_url: default_releases_url(),
            installed_version: default_installed_version(),
            checksum_asset: default_checksum_asset(),
            archive_asset: default_archive_asset(),
            launcher_exe: default_launcher_exe(),
            token_file: None,
            allow_prerelease: false,
            legacy_blob: false,
            relaunch: true,
            poll_interval_ms: default_poll_interval_ms(),
            handoff: HandoffSettings::default(),
        }
    }
}

impl UpdaterConfig {
    /// Loads the configuration for the installation at `install_dir`.
    ///
    /// An explicit path must exist; the default `handover.toml` is optional.
    pub async fn load(install_dir: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::load_from(path).await?,
            None => {
                let path = install_dir.join(CONFIG_FILE_NAME);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    Self::load_from(&path).await?
                } else {
                    debug!("No configuration file at {}, using defaults", path.display());
                    Self::default()
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parses the file at `path`.
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Rejects values no update could succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if !(self.releases_url.starts_with("https://") || self.releases_url.starts_with("http://")) {
            return Err(invalid("releases_url", "must be an http(s) URL"));
        }
        if self.checksum_asset.trim().is_empty() {
            return Err(invalid("checksum_asset", "must not be empty"));
        }
        if self.archive_asset.trim().is_empty() {
            return Err(invalid("archive_asset", "must not be empty"));
        }
        if self.checksum_asset == self.archive_asset {
            return Err(invalid("archive_asset", "must differ from checksum_asset"));
        }
        if self.launcher_exe.trim().is_empty() {
            return Err(invalid("launcher_exe", "must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be greater than zero"));
        }
        if self.handoff.channel_name.is_empty()
            || self.handoff.channel_name.contains(['/', '\\'])
        {
            return Err(invalid("handoff.channel_name", "must be a non-empty name without separators"));
        }
        if self.handoff.connect_attempts == 0 {
            return Err(invalid("handoff.connect_attempts", "must be at least 1"));
        }
        if self.handoff.attempts == 0 {
            return Err(invalid("handoff.attempts", "must be at least 1"));
        }
        Ok(())
    }

    pub fn asset_names(&self) -> AssetNames {
        AssetNames {
            checksum: self.checksum_asset.clone(),
            archive: self.archive_asset.clone(),
        }
    }

    pub fn handoff_config(&self) -> HandoffConfig {
        HandoffConfig {
            connect_attempts: self.handoff.connect_attempts,
            ..HandoffConfig::default()
        }
        .with_channel_name(self.handoff.channel_name.clone())
    }

    pub fn blob_layout(&self) -> BlobLayout {
        if self.legacy_blob { BlobLayout::Legacy } else { BlobLayout::Tagged }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Token file resolved against `install_dir`.
    pub fn token_path(&self, install_dir: &Path) -> Option<PathBuf> {
        self.token_file.as_ref().map(|path| {
            if path.is_absolute() { path.clone() } else { install_dir.join(path) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let config = UpdaterConfig::load(temp.path(), None).await.unwrap();
        assert_eq!(config, UpdaterConfig::default());
        assert_eq!(config.asset_names().checksum, "hash.txt");
        assert_eq!(config.asset_names().archive, "Launcher.zip");
        assert_eq!(config.blob_layout(), BlobLayout::Tagged);
        assert_eq!(config.handoff_config().channel_name, DEFAULT_CHANNEL_NAME);
    }

    #[tokio::test]
    async fn test_file_in_install_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            r#"
installed_version = "v1.2.0"
archive_asset = "Update.zip"
token_file = "secrets/token"
legacy_blob = true

[handoff]
channel_name = "custom_channel"
"#,
        )
        .unwrap();

        let config = UpdaterConfig::load(temp.path(), None).await.unwrap();
        assert_eq!(config.installed_version, "v1.2.0");
        assert_eq!(config.archive_asset, "Update.zip");
        assert_eq!(config.checksum_asset, "hash.txt");
        assert_eq!(config.blob_layout(), BlobLayout::Legacy);
        assert_eq!(config.handoff.channel_name, "custom_channel");
        assert_eq!(config.handoff.connect_attempts, HANDOFF_CONNECT_ATTEMPTS);
        assert_eq!(config.token_path(temp.path()), Some(temp.path().join("secrets/token")));
        assert!(config.relaunch);
    }

    #[tokio::test]
    async fn test_explicit_path_must_exist() {
        let temp = TempDir::new().unwrap();
        let err = UpdaterConfig::load(temp.path(), Some(&temp.path().join("missing.toml")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn test_invalid_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.toml");

        std::fs::write(&path, "releases_url = 42").unwrap();
        assert!(matches!(
            UpdaterConfig::load(temp.path(), Some(&path)).await,
            Err(ConfigError::Parse { .. })
        ));

        std::fs::write(&path, "archive_asset = \"hash.txt\"").unwrap();
        assert!(matches!(
            UpdaterConfig::load(temp.path(), Some(&path)).await,
            Err(ConfigError::Invalid { field: "archive_asset", .. })
        ));

        std::fs::write(&path, "releases_url = \"ftp://example.com\"").unwrap();
        assert!(matches!(
            UpdaterConfig::load(temp.path(), Some(&path)).await,
            Err(ConfigError::Invalid { field: "releases_url", .. })
        ));
    }
}
