//! Zip archive to transfer blob conversion.
//!
//! The transpiler reads every entry of the downloaded archive, appends it to a
//! transfer blob and independently extracts it into a working directory for
//! inspection. Each entry gets its own [`EntryOutcome`]; one corrupt entry does
//! not hide the state of the others.
//!
//! The run fails when the launcher executable is absent or when any entry
//! failed. In both cases the partially written blob is discarded: the blob is
//! built in a temporary file next to its destination and only persisted once
//! the whole archive has been processed.

use std::fs::{self, File};
use std::io::{BufWriter, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::blob::{BlobLayout, BlobWriter, EntryKind};
use crate::core::{BlobError, TranspileError};

/// Result of processing one archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Ok,
    ReadFailed(String),
    WriteFailed(String),
    UnsafePath,
}

/// One line of a [`TranspileReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub outcome: EntryOutcome,
}

/// Per-entry outcome of a transpiler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranspileReport {
    pub entries: Vec<EntryReport>,
    pub launcher_found: bool,
}

impl TranspileReport {
    /// Entries whose outcome is not [`EntryOutcome::Ok`].
    pub fn failures(&self) -> impl Iterator<Item = &EntryReport> {
        self.entries.iter().filter(|e| e.outcome != EntryOutcome::Ok)
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    /// Total bytes of file content written to the blob.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().filter(|e| e.outcome == EntryOutcome::Ok).map(|e| e.size).sum()
    }
}

/// Converts an update archive into a transfer blob.
#[derive(Debug, Clone)]
pub struct Transpiler {
    launcher_exe: String,
    layout: BlobLayout,
}

fn blob_name(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() { None } else { Some(parts.join("/")) }
}

impl Transpiler {
    pub fn new(launcher_exe: impl Into<String>) -> Self {
        Self {
            launcher_exe: launcher_exe.into(),
            layout: BlobLayout::default(),
        }
    }

    /// Selects the blob layout (tagged by default).
    pub fn with_layout(mut self, layout: BlobLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Converts `archive` into the blob at `blob_path`, extracting every entry
    /// under `extract_dir` (recreated from scratch).
    pub fn transpile(
        &self,
        archive: &Path,
        blob_path: &Path,
        extract_dir: &Path,
    ) -> Result<TranspileReport, TranspileError> {
        info!("Transpiling {} into {}", archive.display(), blob_path.display());

        let file = File::open(archive).map_err(|e| TranspileError::OpenArchive {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| TranspileError::OpenArchive {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })?;

        let output_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| TranspileError::Output {
                path,
                source,
            }
        };

        if extract_dir.exists() {
            fs::remove_dir_all(extract_dir).map_err(output_error(extract_dir))?;
        }
        fs::create_dir_all(extract_dir).map_err(output_error(extract_dir))?;

        let blob_dir = blob_path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(blob_dir).map_err(output_error(blob_dir))?;
        let temp = tempfile::NamedTempFile::new_in(blob_dir).map_err(output_error(blob_dir))?;
        let handle = temp.as_file().try_clone().map_err(output_error(temp.path()))?;
        let mut writer = BlobWriter::new(BufWriter::new(handle), self.layout)?;

        let mut report = TranspileReport::default();
        for index in 0..zip.len() {
            let mut entry = match zip.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Unable to read archive entry #{}: {}", index, e);
                    report.entries.push(EntryReport {
                        name: format!("#{index}"),
                        kind: EntryKind::File,
                        size: 0,
                        outcome: EntryOutcome::ReadFailed(e.to_string()),
                    });
                    continue;
                }
            };

            let raw_name = entry.name().to_string();
            let kind = if entry.is_dir() { EntryKind::Directory } else { EntryKind::File };

            let Some(name) = entry.enclosed_name().as_deref().and_then(blob_name) else {
                warn!("Archive entry '{}' escapes the extraction directory", raw_name);
                report.entries.push(EntryReport {
                    name: raw_name,
                    kind,
                    size: 0,
                    outcome: EntryOutcome::UnsafePath,
                });
                continue;
            };

            let mut data = Vec::new();
            if kind == EntryKind::File {
                if let Err(e) = entry.read_to_end(&mut data) {
                    warn!("Unable to decompress '{}': {}", name, e);
                    report.entries.push(EntryReport {
                        name,
                        kind,
                        size: 0,
                        outcome: EntryOutcome::ReadFailed(e.to_string()),
                    });
                    continue;
                }
            }

            let blob_entry_name = match kind {
                EntryKind::Directory => format!("{name}/"),
                EntryKind::File => name.clone(),
            };
            writer.append(&blob_entry_name, kind, &data)?;

            let outcome = match extract_entry(extract_dir, &name, kind, &data) {
                Ok(()) => EntryOutcome::Ok,
                Err(e) => {
                    warn!("Unable to extract '{}': {}", name, e);
                    EntryOutcome::WriteFailed(e.to_string())
                }
            };

            if kind == EntryKind::File && name == self.launcher_exe {
                report.launcher_found = true;
            }

            debug!("Transpiled '{}' ({} bytes)", name, data.len());
            report.entries.push(EntryReport {
                name,
                kind,
                size: data.len() as u64,
                outcome,
            });
        }

        if !report.launcher_found {
            warn!("Archive does not contain {}", self.launcher_exe);
            return Err(TranspileError::MissingLauncher {
                launcher: self.launcher_exe.clone(),
                report,
            });
        }

        let failed = report.failed_count();
        if failed > 0 {
            return Err(TranspileError::EntryFailures {
                failed,
                report,
            });
        }

        let buffered = writer.finish()?;
        let handle = buffered.into_inner().map_err(|e| BlobError::Io(e.into_error()))?;
        handle.sync_all().map_err(output_error(blob_path))?;
        drop(handle);
        temp.persist(blob_path).map_err(|e| TranspileError::Output {
            path: blob_path.to_path_buf(),
            source: e.error,
        })?;

        info!(
            "Transpiled {} entries ({} bytes) into {}",
            report.entries.len(),
            report.total_bytes(),
            blob_path.display()
        );
        Ok(report)
    }
}

fn extract_entry(root: &Path, name: &str, kind: EntryKind, data: &[u8]) -> std::io::Result<()> {
    let target: PathBuf = name.split('/').fold(root.to_path_buf(), |path, part| path.join(part));
    match kind {
        EntryKind::Directory => fs::create_dir_all(&target),
        EntryKind::File => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::TransferBlob;
    use crate::test_utils::{ZipFixtureEntry, write_zip};
    use std::io::Write;

    fn fixture(dir: &Path, entries: &[ZipFixtureEntry<'_>]) -> PathBuf {
        let archive = dir.join("Launcher.zip");
        write_zip(&archive, entries);
        archive
    }

    #[test]
    fn test_transpile_writes_blob_and_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = fixture(
            dir.path(),
            &[
                ZipFixtureEntry::File("launcher", b"\x7fELF"),
                ZipFixtureEntry::Directory("resources/"),
                ZipFixtureEntry::File("resources/strings.txt", b"hello"),
                ZipFixtureEntry::File("empty.cfg", b""),
            ],
        );
        let blob_path = dir.path().join("work").join("update.bin");
        let extract = dir.path().join("work").join("extracted");

        let report = Transpiler::new("launcher").transpile(&archive, &blob_path, &extract).unwrap();

        assert!(report.launcher_found);
        assert_eq!(report.entries.len(), 4);
        assert_eq!(report.failed_count(), 0);
        assert_eq!(fs::read(extract.join("resources").join("strings.txt")).unwrap(), b"hello");
        assert!(extract.join("empty.cfg").is_file());

        let blob = TransferBlob::decode(File::open(&blob_path).unwrap()).unwrap();
        let names: Vec<_> = blob.entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("launcher", EntryKind::File),
                ("resources/", EntryKind::Directory),
                ("resources/strings.txt", EntryKind::File),
                ("empty.cfg", EntryKind::File),
            ]
        );
        assert_eq!(blob.entries[0].data, b"\x7fELF");
    }

    #[test]
    fn test_missing_launcher_discards_blob() {
        let dir = tempfile::tempdir().unwrap();
        let archive = fixture(dir.path(), &[ZipFixtureEntry::File("readme.txt", b"hi")]);
        let blob_path = dir.path().join("update.bin");

        let err = Transpiler::new("launcher")
            .transpile(&archive, &blob_path, &dir.path().join("extracted"))
            .unwrap_err();

        match err {
            TranspileError::MissingLauncher {
                report,
                ..
            } => assert_eq!(report.entries.len(), 1),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!blob_path.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file() && e.file_name() != "Launcher.zip")
            .collect();
        assert!(leftovers.is_empty(), "temporary blob left behind: {leftovers:?}");
    }

    #[test]
    fn test_unsafe_entry_fails_with_report() {
        let dir = tempfile::tempdir().unwrap();
        let archive = fixture(
            dir.path(),
            &[ZipFixtureEntry::File("launcher", b"bin"), ZipFixtureEntry::File("../evil.txt", b"x")],
        );
        let blob_path = dir.path().join("update.bin");

        let err = Transpiler::new("launcher")
            .transpile(&archive, &blob_path, &dir.path().join("extracted"))
            .unwrap_err();

        match err {
            TranspileError::EntryFailures {
                failed,
                report,
            } => {
                assert_eq!(failed, 1);
                assert_eq!(report.entries[0].outcome, EntryOutcome::Ok);
                assert_eq!(report.entries[1].outcome, EntryOutcome::UnsafePath);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dir.path().join("evil.txt").exists());
        assert!(!blob_path.exists());
    }

    #[test]
    fn test_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("Launcher.zip");
        File::create(&archive).unwrap().write_all(b"definitely not a zip").unwrap();

        let err = Transpiler::new("launcher")
            .transpile(&archive, &dir.path().join("b.bin"), &dir.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, TranspileError::OpenArchive { .. }));
    }

    #[test]
    fn test_legacy_layout_output() {
        let dir = tempfile::tempdir().unwrap();
        let archive = fixture(dir.path(), &[ZipFixtureEntry::File("launcher", b"bin")]);
        let blob_path = dir.path().join("update.bin");

        Transpiler::new("launcher")
            .with_layout(BlobLayout::Legacy)
            .transpile(&archive, &blob_path, &dir.path().join("extracted"))
            .unwrap();

        let bytes = fs::read(&blob_path).unwrap();
        assert_eq!(i32::from_le_bytes(bytes[..4].try_into().unwrap()), 1);
    }

    #[test]
    fn test_blob_name_rejects_escapes() {
        assert_eq!(blob_name(Path::new("a/b.txt")).as_deref(), Some("a/b.txt"));
        assert_eq!(blob_name(Path::new("./a")).as_deref(), Some("a"));
        assert_eq!(blob_name(Path::new("../a")), None);
        assert_eq!(blob_name(Path::new("")), None);
    }
}
