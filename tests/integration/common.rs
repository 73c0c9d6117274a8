//! Shared fixtures for the integration tests.

use assert_cmd::Command;
use handover::blob::{BlobEntry, BlobLayout, TransferBlob};
use handover::layout::InstallLayout;
use handover::test_utils::write_tree;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// `handover` with a clean environment, pointed at `install_dir`.
pub fn handover(install_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("handover").unwrap();
    cmd.env_remove("HANDOVER_CONFIG").env_remove("RUST_LOG").arg("--install-dir").arg(install_dir);
    cmd
}

/// An installed launcher with a staged update blob.
pub struct Installation {
    pub temp: TempDir,
}

impl Installation {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        write_tree(
            temp.path(),
            &[
                ("Launcher.exe", b"launcher v1"),
                ("data/strings.txt", b"v1 strings"),
                ("data/legacy.txt", b"dropped in v2"),
                ("user.cfg", b"kept"),
            ],
        );
        std::fs::write(temp.path().join("handover.toml"), "relaunch = false\n").unwrap();
        Self {
            temp,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout::new(self.root())
    }

    /// Writes the v2 blob where `handover update` stages it.
    pub fn stage_blob(&self) -> PathBuf {
        let bytes = TransferBlob::new(vec![
            BlobEntry::file("Launcher.exe", b"launcher v2".to_vec()),
            BlobEntry::directory("data/"),
            BlobEntry::file("data/strings.txt", b"v2 strings".to_vec()),
        ])
        .to_bytes(BlobLayout::Tagged)
        .unwrap();

        let layout = self.layout();
        std::fs::create_dir_all(layout.work_dir()).unwrap();
        std::fs::write(layout.blob(), bytes).unwrap();
        std::fs::write(layout.lock_file(), "downloaded").unwrap();
        layout.blob()
    }

    pub fn read(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.root().join(name)).unwrap()
    }
}
