use predicates::prelude::*;

use crate::common::{Installation, handover};

#[test]
fn test_status_of_fresh_installation() {
    let install = Installation::new();

    handover(install.root())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Update state: none"))
        .stdout(predicate::str::contains("Previous version: none"));
}

#[test]
fn test_status_reports_staged_update() {
    let install = Installation::new();
    install.stage_blob();

    handover(install.root())
        .args(["--no-progress", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("downloaded"))
        .stdout(predicate::str::contains("Staged blob"));
}

#[test]
fn test_status_after_update_lists_backup() {
    let install = Installation::new();
    let blob = install.stage_blob();
    handover(install.root()).args(["unpack", "--resume", "--blob"]).arg(&blob).assert().success();

    handover(install.root())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Previous version: available"));
}

#[test]
fn test_status_rejects_malformed_state() {
    let install = Installation::new();
    let layout = install.layout();
    std::fs::create_dir_all(layout.work_dir()).unwrap();
    std::fs::write(layout.lock_file(), "half-done").unwrap();

    handover(install.root())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("half-done"));
}
