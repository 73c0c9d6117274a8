use predicates::prelude::*;

use crate::common::{Installation, handover};

#[test]
fn test_invalid_config_value() {
    let install = Installation::new();
    std::fs::write(install.root().join("handover.toml"), "poll_interval_ms = 0\n").unwrap();

    handover(install.root())
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("poll_interval_ms"));
}

#[test]
fn test_missing_explicit_config() {
    let install = Installation::new();

    handover(install.root())
        .env("HANDOVER_CONFIG", install.root().join("missing.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unable to read configuration file"));
}

#[test]
fn test_unparsable_config_via_flag() {
    let install = Installation::new();
    let path = install.root().join("broken.toml");
    std::fs::write(&path, "relaunch = \"sometimes\"").unwrap();

    handover(install.root())
        .arg("--config")
        .arg(&path)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration file"));
}

#[test]
fn test_check_reports_unreachable_release_api() {
    let install = Installation::new();
    std::fs::write(
        install.root().join("handover.toml"),
        "releases_url = \"http://127.0.0.1:9/releases\"\n",
    )
    .unwrap();

    handover(install.root())
        .args(["--quiet", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to fetch release information"));
}
