#![allow(deprecated)] // Command::cargo_bin; the macro alternative requires same-package binary

use assert_cmd::Command;
use predicates::str::contains;

fn leadsync_cmd() -> Command {
    let mut cmd = Command::cargo_bin("leadsync").unwrap();
    cmd.env_remove("LEADSYNC_DATA_DIR")
        .env_remove("LEADSYNC_BIND_ADDR")
        .env_remove("LEADSYNC_WEBHOOK_BASE_URL")
        .env_remove("LEADSYNC_FAILED_OP_EXPIRY_MS");
    cmd
}

#[test]
fn help_lists_flags_and_subcommands() {
    leadsync_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("--data-dir"))
        .stdout(contains("--bind-addr"))
        .stdout(contains("--webhook-url"))
        .stdout(contains("failed"));
}

#[test]
fn version_flag_prints_package_version() {
    leadsync_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn failed_on_empty_data_dir_prints_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    let output = leadsync_cmd()
        .arg("--data-dir")
        .arg(dir.path())
        .arg("failed")
        .assert()
        .success()
        .stderr(contains("0 queued failed operation(s)"))
        .get_output()
        .stdout
        .clone();

    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(parsed, serde_json::json!([]));
}

#[test]
fn unknown_flag_is_rejected() {
    leadsync_cmd()
        .arg("--no-such-flag")
        .assert()
        .failure()
        .stderr(contains("unexpected argument"));
}
