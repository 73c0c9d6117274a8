//! Chunked HTTP GET shared by the release resolver and the download engine.
//!
//! The [`Transport`] trait is the seam between the download engine and the
//! network: production code uses [`HttpTransport`] (reqwest), tests substitute
//! an in-memory implementation. Bodies are consumed chunk by chunk so the
//! engine can check its cancellation flag at every chunk boundary.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use std::path::Path;
use tracing::{debug, warn};

use crate::constants;
use crate::core::DownloadError;

/// Value of the `Accept` header sent to the release API.
pub const GITHUB_ACCEPT: &str = "application/vnd.github+json";

/// API version pinned in the `X-GitHub-Api-Version` header.
pub const GITHUB_API_VERSION: &str = "2022-11-28";

/// An opened response body, read incrementally.
#[async_trait]
pub trait ResponseBody: Send {
    /// Total size announced by the server, if any.
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body; `None` once the body is exhausted.
    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadError>;
}

/// Something that can open a GET request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the request and returns the body once the status line and
    /// headers have been received. Non-success statuses are errors.
    async fn open(&self, url: &str) -> Result<Box<dyn ResponseBody>, DownloadError>;
}

/// Buffer size to reserve for a body announcing `content_length` bytes.
///
/// The header is only a hint; it is capped so a bogus value cannot exhaust memory.
pub fn initial_capacity(content_length: Option<u64>) -> usize {
    content_length.map_or(0, |len| len.min(constants::MAX_BODY_PREALLOCATION) as usize)
}

/// Tracks received bytes against the length announced by the server.
#[derive(Debug, Clone)]
pub struct LengthCheck {
    url: String,
    expected: Option<u64>,
    received: u64,
}

impl LengthCheck {
    pub fn new(url: &str, expected: Option<u64>) -> Self {
        Self {
            url: url.to_string(),
            expected,
            received: 0,
        }
    }

    /// Accounts for a chunk, failing as soon as the body outgrows the announced length.
    pub fn add(&mut self, len: usize) -> Result<(), DownloadError> {
        self.received += len as u64;
        match self.expected {
            Some(expected) if self.received > expected => Err(self.mismatch(expected)),
            _ => Ok(()),
        }
    }

    /// Checks the complete body; returns the number of bytes received.
    pub fn finish(&self) -> Result<u64, DownloadError> {
        match self.expected {
            Some(expected) if self.received != expected => Err(self.mismatch(expected)),
            _ => Ok(self.received),
        }
    }

    fn mismatch(&self, expected: u64) -> DownloadError {
        DownloadError::LengthMismatch {
            url: self.url.clone(),
            expected,
            received: self.received,
        }
    }
}

/// Reads a whole body into memory.
pub async fn fetch_bytes(transport: &dyn Transport, url: &str) -> Result<Vec<u8>, DownloadError> {
    let mut body = transport.open(url).await?;
    let mut check = LengthCheck::new(url, body.content_length());
    let mut data = Vec::with_capacity(initial_capacity(body.content_length()));
    while let Some(chunk) = body.chunk().await? {
        check.add(chunk.len())?;
        data.extend_from_slice(&chunk);
    }
    check.finish()?;
    Ok(data)
}

/// Reads a whole body as UTF-8 text.
pub async fn fetch_text(transport: &dyn Transport, url: &str) -> Result<String, DownloadError> {
    let data = fetch_bytes(transport, url).await?;
    String::from_utf8(data).map_err(|e| DownloadError::Transport {
        url: url.to_string(),
        reason: format!("response is not valid UTF-8: {e}"),
    })
}

/// reqwest-backed transport carrying the release API headers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport, authenticating with `token` when one is given.
    pub fn new(token: Option<&str>) -> Result<Self, DownloadError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(GITHUB_API_VERSION));
        headers.insert(USER_AGENT, HeaderValue::from_static(constants::USER_AGENT));

        if let Some(token) = token {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("Ignoring API token containing invalid header characters"),
            }
        }

        let client = reqwest::Client::builder().default_headers(headers).build().map_err(|e| {
            DownloadError::Transport {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            }
        })?;

        Ok(Self {
            client,
        })
    }

    /// Builds a transport, reading the bearer token from `token_file` when it
    /// exists. A missing file means anonymous access.
    pub fn from_token_file(token_file: Option<&Path>) -> Result<Self, DownloadError> {
        let token = token_file.and_then(|path| match std::fs::read_to_string(path) {
            Ok(content) => {
                let token = content.trim().to_string();
                if token.is_empty() {
                    None
                } else {
                    debug!("Using API token from {}", path.display());
                    Some(token)
                }
            }
            Err(e) => {
                debug!("No API token at {}: {}", path.display(), e);
                None
            }
        });

        Self::new(token.as_deref())
    }
}

struct HttpBody {
    url: String,
    response: reqwest::Response,
}

#[async_trait]
impl ResponseBody for HttpBody {
    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadError> {
        self.response.chunk().await.map(|chunk| chunk.map(|bytes| bytes.to_vec())).map_err(|e| {
            DownloadError::Transport {
                url: self.url.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn ResponseBody>, DownloadError> {
        let response =
            self.client.get(url).send().await.map_err(|e| DownloadError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::BadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(Box::new(HttpBody {
            url: url.to_string(),
            response,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTransport;

    #[tokio::test]
    async fn test_fetch_text_concatenates_chunks() {
        let transport = FakeTransport::new();
        transport.add_chunked("https://example.test/a", vec![b"hel".to_vec(), b"lo".to_vec()]);

        let text = fetch_text(&transport, "https://example.test/a").await.unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_fetch_text_rejects_invalid_utf8() {
        let transport = FakeTransport::new();
        transport.add("https://example.test/bin", vec![0xff, 0xfe]);

        let err = fetch_text(&transport, "https://example.test/bin").await.unwrap_err();
        assert!(matches!(err, DownloadError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_huge_announced_length_does_not_preallocate() {
        let transport = FakeTransport::new();
        transport.add_with_length("https://example.test/huge", vec![b"tiny".to_vec()], 1 << 62);

        let err = fetch_bytes(&transport, "https://example.test/huge").await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::LengthMismatch {
                expected,
                received: 4,
                ..
            } if expected == 1 << 62
        ));
        assert_eq!(initial_capacity(Some(1 << 62)), constants::MAX_BODY_PREALLOCATION as usize);
        assert_eq!(initial_capacity(Some(16)), 16);
        assert_eq!(initial_capacity(None), 0);
    }

    #[tokio::test]
    async fn test_body_longer_than_announced_is_rejected() {
        let transport = FakeTransport::new();
        transport.add_with_length("https://example.test/long", vec![b"abc".to_vec(), b"def".to_vec()], 4);

        let err = fetch_bytes(&transport, "https://example.test/long").await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::LengthMismatch {
                expected: 4,
                received: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_length_check_without_announced_length() {
        let mut check = LengthCheck::new("https://example.test/x", None);
        check.add(10).unwrap();
        check.add(5).unwrap();
        assert_eq!(check.finish().unwrap(), 15);
    }

    #[test]
    fn test_from_token_file_missing_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HttpTransport::from_token_file(Some(&dir.path().join("missing.token"))).is_ok());
    }
}
