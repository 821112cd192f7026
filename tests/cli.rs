use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn ratekeeper(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ratekeeper").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("RATEKEEPER_CONFIG")
        .env_remove("RATEKEEPER_STORE_BACKEND")
        .env_remove("RATEKEEPER_LOG_LEVEL")
        .env_remove("RATEKEEPER_LOG_FORMAT");
    cmd
}

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("ratekeeper.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_cli_version() {
    let dir = TempDir::new().unwrap();
    ratekeeper(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ratekeeper 0.1.0"));
}

#[test]
fn test_cli_help() {
    let dir = TempDir::new().unwrap();
    ratekeeper(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("check-config"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_cli_check_config_defaults() {
    let dir = TempDir::new().unwrap();
    ratekeeper(&dir)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("catalog.get_item"))
        .stdout(predicate::str::contains("fail_closed"));
}

#[test]
fn test_cli_check_config_custom_table() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[[operations]]
operation = "orders.list"
rate_per_second = 0.0167
burst_capacity = 20
"#,
    );

    ratekeeper(&dir)
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("orders.list"))
        .stdout(predicate::str::contains("operations: 1"));
}

#[test]
fn test_cli_check_config_rejects_duplicates() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[[operations]]
operation = "orders.list"
rate_per_second = 1.0
burst_capacity = 1

[[operations]]
operation = "orders.list"
rate_per_second = 2.0
burst_capacity = 2
"#,
    );

    ratekeeper(&dir)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("more than once"));
}

#[test]
fn test_cli_status_single_operation() {
    let dir = TempDir::new().unwrap();
    ratekeeper(&dir)
        .args(["status", "--operation", "catalog.search"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"operation\": \"catalog.search\""))
        .stdout(predicate::str::contains("\"burst_capacity\": 2"));
}

#[test]
fn test_cli_status_unknown_operation() {
    let dir = TempDir::new().unwrap();
    ratekeeper(&dir)
        .args(["status", "--operation", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown operation: nope"));
}

#[test]
fn test_cli_quota_file_backend() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[quota]
enabled = true
backend = "file"
state_file = "quota.json"
max_tokens = 100
regen_per_minute = 20
"#,
    );

    ratekeeper(&dir)
        .args(["quota", "--owner", "seller", "--tokens", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"owner\": \"seller\""))
        .stdout(predicate::str::contains("\"result\": \"granted\""));
}

#[test]
fn test_cli_quota_disabled() {
    let dir = TempDir::new().unwrap();
    ratekeeper(&dir)
        .args(["quota", "--owner", "seller"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disabled"));
}

#[test]
fn test_cli_missing_subcommand() {
    let dir = TempDir::new().unwrap();
    ratekeeper(&dir).assert().failure();
}
