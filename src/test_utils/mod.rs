//! Test utilities for handover
//!
//! Helpers shared by unit and integration tests: logging initialization, an
//! in-memory [`FakeTransport`], zip fixture builders and directory snapshots.
//!
//! # Example
//!
//! ```rust,no_run
//! use handover::test_utils::{FakeTransport, init_test_logging};
//!
//! init_test_logging(None);
//! let transport = FakeTransport::new();
//! transport.add("https://example.test/hash.txt", b"abc".to_vec());
//! ```

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, Once};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use crate::core::DownloadError;
use crate::transport::{ResponseBody, Transport};

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Respects `RUST_LOG` when `level` is `None`; does nothing when neither is set.
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .try_init();
    });
}

#[derive(Clone)]
enum FakeRoute {
    Body {
        chunks: Vec<Vec<u8>>,
        delay: Option<Duration>,
        length: Option<u64>,
    },
    Status(u16),
    Failure(String),
}

/// In-memory [`Transport`] serving canned responses by URL.
///
/// Unknown URLs answer HTTP 404.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, FakeRoute>>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, url: &str, route: FakeRoute) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    /// Serves `body` as a single chunk.
    pub fn add(&self, url: &str, body: Vec<u8>) {
        self.add_chunked(url, vec![body]);
    }

    /// Serves the body as the given chunks.
    pub fn add_chunked(&self, url: &str, chunks: Vec<Vec<u8>>) {
        self.route(
            url,
            FakeRoute::Body {
                chunks,
                delay: None,
                length: None,
            },
        );
    }

    /// Serves the chunks while announcing `length` as the content length.
    pub fn add_with_length(&self, url: &str, chunks: Vec<Vec<u8>>, length: u64) {
        self.route(
            url,
            FakeRoute::Body {
                chunks,
                delay: None,
                length: Some(length),
            },
        );
    }

    /// Serves the body as the given chunks, sleeping `delay` before each one.
    pub fn add_slow(&self, url: &str, chunks: Vec<Vec<u8>>, delay: Duration) {
        self.route(
            url,
            FakeRoute::Body {
                chunks,
                delay: Some(delay),
                length: None,
            },
        );
    }

    /// Answers with a non-success status.
    pub fn add_status(&self, url: &str, status: u16) {
        self.route(url, FakeRoute::Status(status));
    }

    /// Fails the connection.
    pub fn add_failure(&self, url: &str, reason: &str) {
        self.route(url, FakeRoute::Failure(reason.to_string()));
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

struct FakeBody {
    chunks: std::vec::IntoIter<Vec<u8>>,
    length: u64,
    delay: Option<Duration>,
}

#[async_trait]
impl ResponseBody for FakeBody {
    fn content_length(&self) -> Option<u64> {
        Some(self.length)
    }

    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.chunks.next())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn ResponseBody>, DownloadError> {
        self.requests.lock().unwrap().push(url.to_string());
        let route = self.routes.lock().unwrap().get(url).cloned();

        match route {
            Some(FakeRoute::Body {
                chunks,
                delay,
                length,
            }) => {
                let length = length.unwrap_or_else(|| chunks.iter().map(|c| c.len() as u64).sum());
                Ok(Box::new(FakeBody {
                    chunks: chunks.into_iter(),
                    length,
                    delay,
                }))
            }
            Some(FakeRoute::Status(status)) => Err(DownloadError::BadStatus {
                url: url.to_string(),
                status,
            }),
            Some(FakeRoute::Failure(reason)) => Err(DownloadError::Transport {
                url: url.to_string(),
                reason,
            }),
            None => Err(DownloadError::BadStatus {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

/// Entry of a zip fixture.
pub enum ZipFixtureEntry<'a> {
    File(&'a str, &'a [u8]),
    Directory(&'a str),
}

/// Writes a zip archive at `path` containing `entries`, in order.
pub fn write_zip(path: &Path, entries: &[ZipFixtureEntry<'_>]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();

    for entry in entries {
        match entry {
            ZipFixtureEntry::File(name, data) => {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            ZipFixtureEntry::Directory(name) => {
                writer.add_directory(*name, options).unwrap();
            }
        }
    }

    writer.finish().unwrap();
}

/// Creates files under `root` from `(relative path, content)` pairs.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (name, content) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

/// Snapshot of a directory: relative path to file content (`None` for
/// directories). Entries whose first component is in `skip` are ignored.
pub fn snapshot_tree(root: &Path, skip: &[&str]) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut snapshot = BTreeMap::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.unwrap();
        let relative = entry.path().strip_prefix(root).unwrap();
        let first = relative.components().next().unwrap().as_os_str().to_string_lossy().to_string();
        if skip.contains(&first.as_str()) {
            continue;
        }

        let key = relative.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            snapshot.insert(key, None);
        } else {
            snapshot.insert(key, Some(std::fs::read(entry.path()).unwrap()));
        }
    }

    snapshot
}
