//! Smoke tests -- verify the binary runs and each subcommand is wired up.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

const OVERRIDES: [&str; 8] = [
    "ACCESSWATCH_CONFIG",
    "LOG_FILE_PATH",
    "HISTORICAL_DATA_PATH",
    "MODEL_PATH",
    "SCALER_PATH",
    "ANOMALY_LOG_PATH",
    "ACCESSWATCH_CONTAMINATION",
    "ACCESSWATCH_POLL_INTERVAL_MS",
];

fn accesswatch() -> Command {
    let mut cmd = Command::cargo_bin("accesswatch").unwrap();
    for key in OVERRIDES {
        cmd.env_remove(key);
    }
    cmd
}

/// Write a config that keeps every path inside `dir`.
fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("accesswatch.toml");
    let d = dir.display();
    std::fs::write(
        &path,
        format!(
            r#"
[paths]
log_files = ["{d}/access.log"]
historical_data = "{d}/access_logs.csv"
model = "{d}/iso_forest_model.json"
transformer = "{d}/scaler.json"
anomaly_store = "{d}/anomaly_feedback.json"

[ingest]
poll_interval_ms = 50
"#
        ),
    )
    .unwrap();
    path
}

fn write_history(dir: &Path) {
    let mut csv = String::from("IP_Address,Method,Resource,Status Code,Bytes Sent\n");
    for i in 0..95 {
        csv.push_str(&format!("10.0.0.{},GET,/home,200,{}\n", i % 50, 495 + i % 10));
    }
    for i in 0..5 {
        csv.push_str(&format!("10.9.9.{i},GET,/home,500,50000\n"));
    }
    std::fs::write(dir.join("access_logs.csv"), csv).unwrap();
}

#[test]
fn test_cli_help() {
    accesswatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Anomaly detection for web server access logs"));
}

#[test]
fn test_cli_version() {
    accesswatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("accesswatch"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["watch", "--help"],
        vec!["train", "--help"],
        vec!["status", "--help"],
        vec!["review", "list", "--help"],
        vec!["review", "submit", "--help"],
        vec!["review", "interactive", "--help"],
    ] {
        accesswatch().args(&args).assert().success();
    }
}

#[test]
fn test_watch_refuses_to_start_without_model() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("access.log"), "").unwrap();

    accesswatch()
        .arg("--config")
        .arg(&config)
        .arg("watch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("accesswatch train"));
    assert!(!dir.path().join("iso_forest_model.json").exists());
}

#[test]
fn test_invalid_config_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[model]\ncontamination = 0.9\n").unwrap();

    accesswatch()
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("contamination"));
}

#[test]
fn test_unloadable_env_config_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[model\ncontamination = ").unwrap();

    accesswatch()
        .env("ACCESSWATCH_CONFIG", &broken)
        .args(["status", "--json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ACCESSWATCH_CONFIG"));

    accesswatch()
        .env("ACCESSWATCH_CONFIG", dir.path().join("missing.toml"))
        .args(["status", "--json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ACCESSWATCH_CONFIG"));
}

#[test]
fn test_train_rejects_csv_without_usable_columns() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("access_logs.csv"), "foo,bar\n1,2\n3,4\n").unwrap();

    accesswatch()
        .arg("--config")
        .arg(&config)
        .arg("train")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no numeric or timestamp column"));
    assert!(!dir.path().join("iso_forest_model.json").exists());
}

#[test]
fn test_status_on_empty_workspace() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    accesswatch()
        .arg("--config")
        .arg(&config)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"missing\""))
        .stdout(predicate::str::contains("\"records\": 0"));
}

#[test]
fn test_train_then_status_reports_ready() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    write_history(dir.path());

    accesswatch()
        .arg("--config")
        .arg(&config)
        .arg("train")
        .assert()
        .success()
        .stdout(predicate::str::contains("Trained model pair"));
    assert!(dir.path().join("iso_forest_model.json").exists());
    assert!(dir.path().join("scaler.json").exists());

    accesswatch()
        .arg("--config")
        .arg(&config)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"ready\""));
}

#[test]
fn test_half_pair_is_reported_invalid() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    write_history(dir.path());

    accesswatch().arg("--config").arg(&config).arg("train").assert().success();
    std::fs::remove_file(dir.path().join("scaler.json")).unwrap();

    accesswatch()
        .arg("--config")
        .arg(&config)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"invalid\""));

    accesswatch()
        .arg("--config")
        .arg(&config)
        .arg("watch")
        .assert()
        .failure();
}

#[test]
fn test_review_list_empty() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    accesswatch()
        .arg("--config")
        .arg(&config)
        .args(["review", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No anomalies pending review."));
}

#[test]
fn test_review_submit_requires_a_verdict() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    accesswatch()
        .arg("--config")
        .arg(&config)
        .args(["review", "submit"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no verdicts given"));
}
