use predicates::prelude::*;

use crate::common::{Installation, handover};
use handover::constants::WORK_DIR_NAME;
use handover::state::{UpdateState, peek_state};
use handover::test_utils::snapshot_tree;

#[test]
fn test_unpack_resume_applies_staged_blob() {
    let install = Installation::new();
    let blob = install.stage_blob();

    handover(install.root())
        .args(["unpack", "--resume", "--blob"])
        .arg(&blob)
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied 2 files and 1 directories"));

    assert_eq!(install.read("Launcher.exe"), b"launcher v2");
    assert_eq!(install.read("data/strings.txt"), b"v2 strings");
    assert_eq!(install.read("user.cfg"), b"kept");
    assert!(!install.root().join("data/legacy.txt").exists());
    assert!(!blob.exists());

    let layout = install.layout();
    assert_eq!(peek_state(&layout.lock_file()).unwrap(), UpdateState::None);
    let log = std::fs::read_to_string(layout.unpacker_log()).unwrap();
    assert!(log.contains("Update applied"), "{log}");
}

#[test]
fn test_unpack_relative_blob_path() {
    let install = Installation::new();
    install.stage_blob();

    handover(install.root())
        .args(["unpack", "--resume", "--blob", ".handover/launcher_update.bin"])
        .assert()
        .success();
    assert_eq!(install.read("Launcher.exe"), b"launcher v2");
}

#[test]
fn test_unpack_truncated_blob_changes_nothing() {
    let install = Installation::new();
    let blob = install.stage_blob();
    let bytes = std::fs::read(&blob).unwrap();
    std::fs::write(&blob, &bytes[..bytes.len() / 2]).unwrap();
    let before = snapshot_tree(install.root(), &[WORK_DIR_NAME]);

    handover(install.root())
        .args(["unpack", "--resume", "--blob"])
        .arg(&blob)
        .assert()
        .failure()
        .stderr(predicate::str::contains("truncated"));

    assert_eq!(snapshot_tree(install.root(), &[WORK_DIR_NAME]), before);
    assert_eq!(peek_state(&install.layout().lock_file()).unwrap(), UpdateState::Downloaded);
}

#[test]
fn test_unpack_missing_blob() {
    let install = Installation::new();

    handover(install.root())
        .args(["unpack", "--resume", "--blob", "nowhere.bin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unable to open transfer blob"));
}
