//! Paths inside an installation directory.

use std::path::{Path, PathBuf};

use crate::constants::{
    BLOB_FILE_NAME, EXTRACT_DIR_NAME, SUCCESSOR_EXE_STEM, UNPACKER_LOG_NAME, WORK_DIR_NAME,
};
use crate::state::lock_path;

/// Well-known locations of the installation at `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/.handover`
    pub fn work_dir(&self) -> PathBuf {
        self.root.join(WORK_DIR_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        lock_path(&self.root)
    }

    pub fn blob(&self) -> PathBuf {
        self.work_dir().join(BLOB_FILE_NAME)
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.work_dir().join(EXTRACT_DIR_NAME)
    }

    /// Download location of the asset named `asset`.
    pub fn download(&self, asset: &str) -> PathBuf {
        self.work_dir().join(asset)
    }

    /// Copy of this executable that runs as the successor.
    pub fn successor_exe(&self) -> PathBuf {
        self.work_dir().join(format!("{}{}", SUCCESSOR_EXE_STEM, std::env::consts::EXE_SUFFIX))
    }

    pub fn unpacker_log(&self) -> PathBuf {
        self.work_dir().join(UNPACKER_LOG_NAME)
    }

    pub fn launcher(&self, launcher_exe: &str) -> PathBuf {
        self.root.join(launcher_exe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = InstallLayout::new("/opt/launcher");
        assert_eq!(layout.work_dir(), Path::new("/opt/launcher/.handover"));
        assert_eq!(layout.blob(), Path::new("/opt/launcher/.handover/launcher_update.bin"));
        assert_eq!(layout.lock_file(), Path::new("/opt/launcher/.handover/update.lock"));
        assert!(layout.successor_exe().starts_with(layout.work_dir()));
        assert_eq!(layout.download("Launcher.zip"), Path::new("/opt/launcher/.handover/Launcher.zip"));
    }
}
