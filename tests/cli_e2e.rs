//! End-to-end CLI tests for the docfetch binary.

// `Command::cargo_bin` is deprecated in assert_cmd >=2.0.17 in favor of
// `cargo::cargo_bin_cmd!` macro. Suppressed until migration to the new API.
#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_docfetch_config(config_home: &std::path::Path, contents: &str) {
    let config_dir = config_home.join("docfetch");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("config.toml"), contents).unwrap();
}

fn docfetch(config_home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("docfetch").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_binary_help_displays_usage() {
    let tempdir = TempDir::new().unwrap();
    docfetch(tempdir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Fetch documents in bulk"))
        .stdout(predicate::str::contains("--checkpoint"))
        .stdout(predicate::str::contains("--proxy-strategy"));
}

#[test]
fn test_binary_version_displays_version() {
    let tempdir = TempDir::new().unwrap();
    docfetch(tempdir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("docfetch"));
}

#[test]
fn test_binary_invalid_flag_fails() {
    let tempdir = TempDir::new().unwrap();
    docfetch(tempdir.path())
        .arg("--no-such-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--no-such-flag"));
}

#[test]
fn test_binary_empty_stdin_exits_cleanly() {
    let tempdir = TempDir::new().unwrap();
    docfetch(tempdir.path())
        .write_stdin("")
        .assert()
        .success()
        .stderr(predicate::str::contains("No valid URLs found"));
}

#[test]
fn test_binary_resume_without_checkpoint_fails() {
    let tempdir = TempDir::new().unwrap();
    docfetch(tempdir.path())
        .arg("--resume")
        .arg("https://docs.test/a.pdf")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--resume needs a checkpoint"));
}

#[test]
fn test_binary_rejects_out_of_range_config_value() {
    let tempdir = TempDir::new().unwrap();
    write_docfetch_config(tempdir.path(), "workers = 500\n");
    docfetch(tempdir.path())
        .arg("https://docs.test/a.pdf")
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers"));
}

#[test]
fn test_binary_required_proxy_mode_without_proxies_fails() {
    let tempdir = TempDir::new().unwrap();
    docfetch(tempdir.path())
        .args(["--proxy-mode", "required", "https://docs.test/a.pdf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least one proxy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_fetches_stdin_urls_and_writes_checkpoint() {
    let server = MockServer::start().await;
    let mut body = b"%PDF-1.5\n".to_vec();
    body.extend(std::iter::repeat_n(b'7', 200));
    Mock::given(method("GET"))
        .and(path_regex(r"^/judgments/\d+\.pdf$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(3)
        .mount(&server)
        .await;

    let tempdir = TempDir::new().unwrap();
    let out_dir = tempdir.path().join("out");
    let checkpoint = tempdir.path().join("job.json");
    let input = format!(
        "# nightly batch\n\
         supreme_court {uri}/judgments/1.pdf\n\
         {uri}/judgments/2.pdf Order of 2 May\n\
         tribunal {uri}/judgments/3.pdf\n\
         {uri}/judgments/1.pdf\n\
         no url on this line\n",
        uri = server.uri()
    );

    let mut cmd = docfetch(tempdir.path());
    cmd.args(["--workers", "2", "--rate", "0", "--max-retries", "0"])
        .arg("--output-dir")
        .arg(&out_dir)
        .arg("--checkpoint")
        .arg(&checkpoint)
        .write_stdin(input);

    let assert = tokio::task::spawn_blocking(move || cmd.assert())
        .await
        .unwrap()
        .success();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("3 completed, 0 failed"), "stderr: {stderr}");

    assert_eq!(std::fs::read_dir(&out_dir).unwrap().count(), 3);
    let record: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&checkpoint).unwrap()).unwrap();
    assert_eq!(record["status"], "completed");
    assert_eq!(record["successful"], 3);
}
