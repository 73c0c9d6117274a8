//! Atomic application of a transfer blob to the installation directory.
//!
//! Every record is staged in one [`FsTransaction`]. Only when the whole blob
//! decoded and staged cleanly is the transaction committed; any failure before
//! that drops it, leaving the installation exactly as it was.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::blob::{BlobReader, EntryKind};
use crate::core::UnpackError;
use crate::transaction::{CommittedTransaction, FsTransaction};

/// Summary of an applied blob.
#[derive(Debug)]
pub struct UnpackOutcome {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
    /// The committed transaction, holding the replaced files.
    pub transaction: CommittedTransaction,
}

impl UnpackOutcome {
    pub fn records(&self) -> usize {
        self.files + self.directories
    }
}

/// Applies transfer blobs to the tree at `root`.
#[derive(Debug, Clone)]
pub struct Unpacker {
    root: PathBuf,
}

impl Unpacker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Applies the blob stored at `blob_path`.
    pub fn unpack_file(&self, blob_path: &Path) -> Result<UnpackOutcome, UnpackError> {
        let file = File::open(blob_path).map_err(|source| UnpackError::OpenBlob {
            path: blob_path.to_path_buf(),
            source,
        })?;
        info!("Unpacking {} into {}", blob_path.display(), self.root.display());
        self.unpack(BufReader::new(file))
    }

    /// Applies the blob read from `reader`. Blocking.
    pub fn unpack<R: Read>(&self, reader: R) -> Result<UnpackOutcome, UnpackError> {
        let records = BlobReader::new(reader)?;
        debug!(layout = ?records.layout(), count = records.record_count(), "Decoded blob header");

        let mut transaction = FsTransaction::begin(&self.root)?.keep_backup();
        let mut files = 0;
        let mut directories = 0;
        let mut bytes = 0u64;

        for record in records {
            let entry = record?;
            match entry.kind {
                EntryKind::Directory => {
                    debug!("Recreating directory {}", entry.name);
                    transaction.create_dir(&entry.name)?;
                    directories += 1;
                }
                EntryKind::File => {
                    debug!(size = entry.data.len(), "Writing {}", entry.name);
                    transaction.write_file(&entry.name, &entry.data)?;
                    files += 1;
                    bytes += entry.data.len() as u64;
                }
            }
        }

        let transaction = transaction.commit()?;
        info!(files, directories, bytes, "Update applied");

        Ok(UnpackOutcome {
            files,
            directories,
            bytes,
            transaction,
        })
    }
}
