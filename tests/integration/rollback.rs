use predicates::prelude::*;

use crate::common::{Installation, handover};

#[test]
fn test_rollback_without_backup_fails() {
    let install = Installation::new();

    handover(install.root())
        .arg("rollback")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No previous version is available"))
        .stderr(predicate::str::contains("suggestion"));
}

#[test]
fn test_rollback_restores_once() {
    let install = Installation::new();
    let blob = install.stage_blob();

    handover(install.root()).args(["unpack", "--resume", "--blob"]).arg(&blob).assert().success();
    assert_eq!(install.read("Launcher.exe"), b"launcher v2");

    handover(install.root())
        .arg("rollback")
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored the previous version"));

    assert_eq!(install.read("Launcher.exe"), b"launcher v1");
    assert_eq!(install.read("data/strings.txt"), b"v1 strings");
    assert_eq!(install.read("data/legacy.txt"), b"dropped in v2");

    handover(install.root()).arg("rollback").assert().failure();
}
