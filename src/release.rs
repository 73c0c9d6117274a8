//! Release resolution against a GitHub-style release API.
//!
//! The resolver fetches the release list, picks the first entry allowed by the
//! [`SelectionPolicy`], decides whether it is newer than the installed version
//! and extracts the checksum and archive download URLs.
//!
//! Selection is a pure function ([`select_release`]) so the policy can be
//! tested without a network; [`ReleaseResolver`] only adds the fetch.
//!
//! # Version comparison
//!
//! Labels are compared after stripping a leading `v`. When both sides parse as
//! semver the candidate must be strictly newer; otherwise any difference counts
//! as an update. Installed `dev` and `nightly` builds are never out of date
//! unless the policy forces an update.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{DownloadError, ResolveError};
use crate::transport::{Transport, fetch_text};

/// One downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// One release as returned by the release API.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseEntry {
    /// Human version label: the release name, or the tag when unnamed.
    pub fn label(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.tag_name,
        }
    }

    fn asset_url(&self, asset: &str) -> Option<&str> {
        self.assets.iter().find(|a| a.name == asset).map(|a| a.browser_download_url.as_str())
    }
}

/// The release chosen for an update attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub version: String,
    pub archive_url: String,
    pub checksum_url: String,
    pub prerelease: bool,
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A release that should be installed.
    Candidate(ReleaseDescriptor),
    /// The installation already runs the selected release.
    UpToDate {
        version: String,
    },
}

/// Which releases may be selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub allow_prerelease: bool,
    pub force: bool,
}

/// Names of the two required assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetNames {
    pub checksum: String,
    pub archive: String,
}

impl Default for AssetNames {
    fn default() -> Self {
        Self {
            checksum: crate::constants::DEFAULT_CHECKSUM_ASSET.to_string(),
            archive: crate::constants::DEFAULT_ARCHIVE_ASSET.to_string(),
        }
    }
}

fn normalize(version: &str) -> &str {
    let version = version.trim();
    version.strip_prefix('v').or_else(|| version.strip_prefix('V')).unwrap_or(version)
}

/// Whether `candidate` is not newer than `installed`.
pub fn is_up_to_date(installed: &str, candidate: &str) -> bool {
    let installed = normalize(installed);
    if installed.eq_ignore_ascii_case("dev") || installed.eq_ignore_ascii_case("nightly") {
        debug!("Installed version '{}' is a development build, not checking", installed);
        return true;
    }

    let candidate = normalize(candidate);
    if installed.eq_ignore_ascii_case(candidate) {
        return true;
    }

    match (semver::Version::parse(installed), semver::Version::parse(candidate)) {
        (Ok(installed), Ok(candidate)) => candidate <= installed,
        _ => false,
    }
}

/// Picks the release to install from an API release list.
pub fn select_release(
    releases: &[ReleaseEntry],
    policy: SelectionPolicy,
    installed: &str,
    assets: &AssetNames,
) -> Result<Resolution, ResolveError> {
    let entry = releases
        .iter()
        .find(|release| !release.prerelease || policy.allow_prerelease)
        .ok_or(ResolveError::NoRelease)?;

    describe_release(entry, policy, installed, assets)
}

/// Applies the up-to-date check and extracts the asset URLs of one release.
pub fn describe_release(
    entry: &ReleaseEntry,
    policy: SelectionPolicy,
    installed: &str,
    assets: &AssetNames,
) -> Result<Resolution, ResolveError> {
    let version = entry.label().to_string();

    if !policy.force && is_up_to_date(installed, &version) {
        info!("Installed version {} is up to date (latest: {})", installed, version);
        return Ok(Resolution::UpToDate {
            version,
        });
    }

    let checksum = entry.asset_url(&assets.checksum);
    let archive = entry.asset_url(&assets.archive);

    match (checksum, archive) {
        (Some(checksum), Some(archive)) => {
            debug!(version = %version, archive = %archive, checksum = %checksum, "Selected release");
            Ok(Resolution::Candidate(ReleaseDescriptor {
                version,
                archive_url: archive.to_string(),
                checksum_url: checksum.to_string(),
                prerelease: entry.prerelease,
            }))
        }
        (None, None) => Err(ResolveError::NoAssets {
            version,
        }),
        (None, Some(_)) => Err(ResolveError::MissingChecksum {
            version,
            asset: assets.checksum.clone(),
        }),
        (Some(_), None) => Err(ResolveError::MissingArchive {
            version,
            asset: assets.archive.clone(),
        }),
    }
}

/// Fetches release documents and applies [`select_release`].
pub struct ReleaseResolver {
    transport: Arc<dyn Transport>,
    endpoint: String,
    assets: AssetNames,
    installed_version: String,
}

impl ReleaseResolver {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        assets: AssetNames,
        installed_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            assets,
            installed_version: installed_version.into(),
        }
    }

    /// Version the resolver compares candidates against.
    pub fn installed_version(&self) -> &str {
        &self.installed_version
    }

    async fn fetch(&self, url: &str) -> Result<String, ResolveError> {
        fetch_text(self.transport.as_ref(), url).await.map_err(|e: DownloadError| {
            ResolveError::FetchFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Resolves against the release list endpoint.
    pub async fn resolve(&self, policy: SelectionPolicy) -> Result<Resolution, ResolveError> {
        debug!("Fetching release list from {}", self.endpoint);
        let body = self.fetch(&self.endpoint).await?;
        let releases: Vec<ReleaseEntry> =
            serde_json::from_str(&body).map_err(|e| ResolveError::FetchFailed {
                url: self.endpoint.clone(),
                reason: format!("invalid release list: {e}"),
            })?;

        select_release(&releases, policy, &self.installed_version, &self.assets)
    }

    /// Resolves a single release document, bypassing the list.
    pub async fn resolve_url(
        &self,
        url: &str,
        policy: SelectionPolicy,
    ) -> Result<Resolution, ResolveError> {
        debug!("Fetching release document from {}", url);
        let body = self.fetch(url).await?;
        let entry: ReleaseEntry =
            serde_json::from_str(&body).map_err(|e| ResolveError::FetchFailed {
                url: url.to_string(),
                reason: format!("invalid release document: {e}"),
            })?;

        if entry.label().is_empty() {
            return Err(ResolveError::FetchFailed {
                url: url.to_string(),
                reason: "release document has neither a name nor a tag".to_string(),
            });
        }

        describe_release(&entry, policy, &self.installed_version, &self.assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTransport;

    fn release(name: &str, prerelease: bool, assets: &[&str]) -> ReleaseEntry {
        ReleaseEntry {
            name: Some(name.to_string()),
            tag_name: name.to_string(),
            prerelease,
            assets: assets
                .iter()
                .map(|asset| ReleaseAsset {
                    name: (*asset).to_string(),
                    browser_download_url: format!("https://dl.test/{name}/{asset}"),
                })
                .collect(),
        }
    }

    fn both() -> [&'static str; 2] {
        ["hash.txt", "Launcher.zip"]
    }

    fn candidate(resolution: Resolution) -> ReleaseDescriptor {
        match resolution {
            Resolution::Candidate(descriptor) => descriptor,
            other => panic!("expected a candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_stable_release_selected_when_prereleases_disallowed() {
        let releases = vec![release("v2.0.0-beta", true, &both()), release("v1.5.0", false, &both())];
        let policy = SelectionPolicy::default();

        let descriptor =
            candidate(select_release(&releases, policy, "v1.0.0", &AssetNames::default()).unwrap());
        assert_eq!(descriptor.version, "v1.5.0");
        assert_eq!(descriptor.archive_url, "https://dl.test/v1.5.0/Launcher.zip");
        assert_eq!(descriptor.checksum_url, "https://dl.test/v1.5.0/hash.txt");
        assert!(!descriptor.prerelease);
    }

    #[test]
    fn test_first_release_selected_when_prereleases_allowed() {
        let releases = vec![release("v2.0.0-beta", true, &both()), release("v1.5.0", false, &both())];
        let policy = SelectionPolicy {
            allow_prerelease: true,
            force: false,
        };

        let descriptor =
            candidate(select_release(&releases, policy, "v1.0.0", &AssetNames::default()).unwrap());
        assert_eq!(descriptor.version, "v2.0.0-beta");
        assert!(descriptor.prerelease);
    }

    #[test]
    fn test_force_bypasses_up_to_date() {
        let releases = vec![release("v1.5.0", false, &both())];
        let assets = AssetNames::default();

        let resolution =
            select_release(&releases, SelectionPolicy::default(), "v1.5.0", &assets).unwrap();
        assert_eq!(
            resolution,
            Resolution::UpToDate {
                version: "v1.5.0".to_string()
            }
        );

        let forced = SelectionPolicy {
            allow_prerelease: false,
            force: true,
        };
        let descriptor = candidate(select_release(&releases, forced, "v1.5.0", &assets).unwrap());
        assert_eq!(descriptor.version, "v1.5.0");
    }

    #[test]
    fn test_missing_assets() {
        let assets = AssetNames::default();
        let policy = SelectionPolicy::default();

        let none = [release("v2.0.0", false, &[])];
        assert!(matches!(
            select_release(&none, policy, "v1.0.0", &assets),
            Err(ResolveError::NoAssets { .. })
        ));

        let no_hash = [release("v2.0.0", false, &["Launcher.zip"])];
        assert!(matches!(
            select_release(&no_hash, policy, "v1.0.0", &assets),
            Err(ResolveError::MissingChecksum { .. })
        ));

        let no_zip = [release("v2.0.0", false, &["hash.txt", "notes.md"])];
        assert!(matches!(
            select_release(&no_zip, policy, "v1.0.0", &assets),
            Err(ResolveError::MissingArchive { .. })
        ));
    }

    #[test]
    fn test_no_release_matches_policy() {
        let releases = vec![release("v2.0.0-rc1", true, &both())];
        assert!(matches!(
            select_release(&releases, SelectionPolicy::default(), "v1.0.0", &AssetNames::default()),
            Err(ResolveError::NoRelease)
        ));
    }

    #[test]
    fn test_is_up_to_date() {
        assert!(is_up_to_date("v1.2.3", "1.2.3"));
        assert!(is_up_to_date("1.2.3", "V1.2.3"));
        assert!(is_up_to_date("1.3.0", "1.2.9"));
        assert!(!is_up_to_date("1.2.3", "1.2.4"));
        assert!(!is_up_to_date("1.2.3", "2.0.0-beta.1"));
        assert!(is_up_to_date("dev", "99.0.0"));
        assert!(is_up_to_date("nightly", "99.0.0"));
        assert!(!is_up_to_date("release-a", "release-b"));
    }

    #[test]
    fn test_unnamed_release_uses_tag() {
        let mut entry = release("v3.0.0", false, &both());
        entry.name = Some(String::new());
        assert_eq!(entry.label(), "v3.0.0");
        entry.name = None;
        assert_eq!(entry.label(), "v3.0.0");
    }

    #[tokio::test]
    async fn test_resolver_fetches_release_list() {
        let transport = Arc::new(FakeTransport::new());
        let body = serde_json::json!([
            {
                "name": "v1.1.0",
                "tag_name": "v1.1.0",
                "prerelease": false,
                "assets": [
                    {"name": "hash.txt", "browser_download_url": "https://dl.test/hash.txt"},
                    {"name": "Launcher.zip", "browser_download_url": "https://dl.test/Launcher.zip"}
                ]
            }
        ]);
        transport.add("https://api.test/releases", body.to_string().into_bytes());

        let resolver =
            ReleaseResolver::new(transport, "https://api.test/releases", AssetNames::default(), "v1.0.0");
        let descriptor = candidate(resolver.resolve(SelectionPolicy::default()).await.unwrap());
        assert_eq!(descriptor.archive_url, "https://dl.test/Launcher.zip");
    }

    #[tokio::test]
    async fn test_resolver_reports_fetch_failures() {
        let transport = Arc::new(FakeTransport::new());
        transport.add("https://api.test/garbage", b"not json".to_vec());

        let resolver =
            ReleaseResolver::new(transport, "https://api.test/missing", AssetNames::default(), "v1.0.0");
        assert!(matches!(
            resolver.resolve(SelectionPolicy::default()).await,
            Err(ResolveError::FetchFailed { .. })
        ));
        assert!(matches!(
            resolver.resolve_url("https://api.test/garbage", SelectionPolicy::default()).await,
            Err(ResolveError::FetchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_single_release_document() {
        let transport = Arc::new(FakeTransport::new());
        let body = serde_json::json!({
            "name": "v0.9.0",
            "tag_name": "v0.9.0",
            "prerelease": true,
            "assets": [
                {"name": "hash.txt", "browser_download_url": "https://dl.test/h"},
                {"name": "Launcher.zip", "browser_download_url": "https://dl.test/z"}
            ]
        });
        transport.add("https://api.test/releases/7", body.to_string().into_bytes());

        let resolver =
            ReleaseResolver::new(transport, "https://api.test/releases", AssetNames::default(), "v1.0.0");
        let policy = SelectionPolicy {
            allow_prerelease: false,
            force: true,
        };
        let descriptor =
            candidate(resolver.resolve_url("https://api.test/releases/7", policy).await.unwrap());
        assert_eq!(descriptor.version, "v0.9.0");
        assert!(descriptor.prerelease);
    }
}
