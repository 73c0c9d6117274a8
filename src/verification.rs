//! Integrity verification of downloaded archives.
//!
//! The archive is hashed in fixed-size chunks and compared against the
//! published checksum. A read error is a hard failure, never a match.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::core::IntegrityError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Verifies the integrity of a downloaded archive using its published SHA-256.
///
/// The published checksum file may hold a bare hex digest, a `sha256:` prefixed
/// digest, or a `sha256sum`-style line (`<hex>  <name>`); surrounding whitespace
/// and line endings are ignored and the comparison is case-insensitive.
///
/// Any I/O error while hashing is reported as [`IntegrityError::BadHash`]; an
/// unreadable archive is never treated as matching.
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Computes the lowercase hex SHA-256 of a file, streaming its content.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use handover::verification::ChecksumVerifier;
    /// use std::path::Path;
    ///
    /// # async fn example() -> Result<(), handover::core::IntegrityError> {
    /// let digest = ChecksumVerifier::compute_sha256(Path::new("Launcher.zip")).await?;
    /// println!("SHA256: {}", digest);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn compute_sha256(file_path: &Path) -> Result<String, IntegrityError> {
        debug!("Computing SHA256 checksum for: {:?}", file_path);

        let bad_hash = |source| IntegrityError::BadHash {
            path: file_path.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::open(file_path).await.map_err(bad_hash)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = file.read(&mut buffer).await.map_err(bad_hash)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Extracts the digest from a published checksum text.
    ///
    /// Returns `None` when nothing but whitespace was published.
    pub fn normalize_checksum(published: &str) -> Option<String> {
        let trimmed = published.trim_start().trim_end_matches(['\r', '\n']);
        let token = trimmed.split_whitespace().next()?;
        let token = token
            .strip_prefix("sha256:")
            .or_else(|| token.strip_prefix("SHA256:"))
            .unwrap_or(token);

        if token.is_empty() { None } else { Some(token.to_ascii_lowercase()) }
    }

    /// Returns whether the archive's digest equals the published checksum.
    pub async fn verify(file_path: &Path, published: &str) -> Result<bool, IntegrityError> {
        info!("Verifying checksum for: {:?}", file_path);

        let expected = Self::normalize_checksum(published).ok_or(IntegrityError::EmptyChecksum)?;
        let actual = Self::compute_sha256(file_path).await?;

        let matches = actual.eq_ignore_ascii_case(&expected);
        if matches {
            info!("Checksum verification successful");
        } else {
            warn!("Checksum mismatch: expected {}, computed {}", expected, actual);
        }
        Ok(matches)
    }

    /// Like [`ChecksumVerifier::verify`], but a mismatch is an error.
    pub async fn verify_checksum(file_path: &Path, published: &str) -> Result<(), IntegrityError> {
        if Self::verify(file_path, published).await? {
            return Ok(());
        }

        let expected = Self::normalize_checksum(published).unwrap_or_default();
        let actual = Self::compute_sha256(file_path).await?;
        Err(IntegrityError::Mismatch {
            path: file_path.to_path_buf(),
            expected,
            actual,
        })
    }
}
