//! End-to-end tests of the marketsync binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn marketsync() -> Command {
    let mut cmd = Command::cargo_bin("marketsync").unwrap();
    // Keep host configuration out of the test runs.
    cmd.env_remove("MARKETSYNC_API_URL")
        .env_remove("MARKETSYNC_API_TOKEN")
        .env_remove("MARKETSYNC_ENTITIES_CONFIG")
        .env_remove("MARKETSYNC_ENTITIES_JSON")
        .env_remove("DATABASE_URL")
        .env_remove("WAREHOUSE_URL");
    cmd
}

#[test]
fn help_lists_subcommands() {
    marketsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("test"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn init_writes_a_loadable_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("marketsync.toml");

    marketsync()
        .arg("init")
        .arg("--output")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("[api]"));
    assert!(content.contains("[[entities]]"));

    // The generated sample must load and validate as-is.
    let config = marketsync::SyncConfig::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config.entities.len(), 1);
    assert_eq!(config.entities[0].name, "offers");
}

#[test]
fn sync_without_configuration_fails() {
    let dir = tempfile::tempdir().unwrap();

    marketsync()
        .arg("sync")
        .current_dir(dir.path())
        .assert()
        .failure();
}

#[test]
fn rejects_unknown_subcommand() {
    marketsync()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized"));
}
