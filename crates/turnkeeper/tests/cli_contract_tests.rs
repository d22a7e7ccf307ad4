//! CLI command contract tests
//!
//! Runs the `tk` binary against temp config files and checks:
//! - Deterministic exit codes
//! - One JSON object per stdout line in `tk run`
//! - Actionable error messages for bad configs

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

// =============================================================================
// Test fixture helpers
// =============================================================================

/// Write a config file with the given scheduler section.
fn write_config(scheduler: &str) -> (TempDir, String) {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("turnkeeper.toml");
    std::fs::write(
        &path,
        format!("[general]\nlog_level = \"warn\"\n\n[scheduler]\n{scheduler}\n"),
    )
    .expect("write config");
    let path = path.to_string_lossy().to_string();
    (dir, path)
}

#[allow(deprecated)]
fn tk_cmd(config: &str) -> Command {
    let mut cmd = Command::cargo_bin("tk").expect("tk binary should be built");
    cmd.env_remove("TURNKEEPER_CONFIG");
    cmd.env_remove("RUST_LOG");
    cmd.args(["--config", config]);
    cmd
}

fn json_lines(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap_or_else(|e| panic!("bad JSON line {line}: {e}")))
        .collect()
}

fn find<'a>(lines: &'a [Value], op: &str, requester: &str) -> Vec<&'a Value> {
    lines
        .iter()
        .filter(|v| v["op"] == op && v["requester"] == requester)
        .collect()
}

// =============================================================================
// tk check-config
// =============================================================================

#[test]
fn contract_check_config_prints_effective_toml() {
    let (_dir, config) = write_config("reservation_ttl_secs = 30\nactive_ttl_secs = 300");
    tk_cmd(&config)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("# config ok"))
        .stdout(predicate::str::contains("reservation_ttl_secs = 30"))
        .stdout(predicate::str::contains("active_ttl_secs = 300"));
}

#[test]
fn contract_check_config_json() {
    let (_dir, config) = write_config("settle_delay_ms = 750");
    let output = tk_cmd(&config)
        .args(["check-config", "--json"])
        .output()
        .expect("tk check-config --json should execute");
    assert!(output.status.success());

    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(parsed["ok"], true);
    assert_eq!(parsed["config"]["scheduler"]["settle_delay_ms"], 750);
    assert_eq!(parsed["config"]["scheduler"]["reservation_ttl_secs"], 180);
}

#[test]
fn contract_invalid_config_fails_with_remediation() {
    let (_dir, config) = write_config("reservation_ttl_secs = 900\nactive_ttl_secs = 600");
    tk_cmd(&config)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be shorter"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn contract_unusable_log_file_fails_with_remediation() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("turnkeeper.toml");
    // a directory cannot be opened as the log file
    std::fs::write(
        &path,
        format!("[general]\nlog_file = {:?}\n", dir.path().display().to_string()),
    )
    .expect("write config");

    tk_cmd(&path.to_string_lossy())
        .arg("run")
        .write_stdin("status\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot open log file"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn contract_missing_config_file_fails() {
    let dir = TempDir::new().expect("create temp dir");
    let missing = dir.path().join("nope.toml");
    tk_cmd(&missing.to_string_lossy())
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

// =============================================================================
// tk run
// =============================================================================

#[test]
fn contract_run_script_happy_path_and_queue() {
    let (dir, config) = write_config("");
    let script = dir.path().join("turns.txt");
    std::fs::write(
        &script,
        "\
# two requesters share one pipeline
request guild alice invoices
request guild bob menus
begin guild bob
begin guild alice
complete guild alice
status guild bob
quit
request guild carol ignored-after-quit
",
    )
    .expect("write script");

    let output = tk_cmd(&config)
        .args(["run", "--script"])
        .arg(&script)
        .output()
        .expect("tk run should execute");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let lines = json_lines(&output.stdout);

    let alice_req = find(&lines, "request", "alice");
    assert_eq!(alice_req[0]["result"]["outcome"], "granted");
    let bob_req = find(&lines, "request", "bob");
    assert_eq!(bob_req[0]["result"]["outcome"], "queued_at");
    assert_eq!(bob_req[0]["result"]["position"], 1);

    let bob_begin = find(&lines, "begin", "bob");
    assert_eq!(bob_begin[0]["ok"], false);
    assert_eq!(bob_begin[0]["benign"], false);
    assert!(bob_begin[0]["error"].as_str().unwrap().contains("reservation"));

    assert_eq!(find(&lines, "begin", "alice")[0]["ok"], true);
    assert_eq!(find(&lines, "complete", "alice")[0]["ok"], true);
    assert_eq!(find(&lines, "status", "bob")[0]["result"]["status"], "reserved");
    assert!(find(&lines, "request", "carol").is_empty());

    let notices: Vec<&Value> = lines.iter().filter(|v| v["op"] == "notice").collect();
    assert!(notices.iter().any(|n| {
        n["notice"]["requester"] == "bob" && n["notice"]["kind"] == "session_granted_after_wait"
    }));
}

#[test]
fn contract_run_reservation_expires_from_stdin() {
    let (_dir, config) = write_config("reservation_ttl_secs = 1\nactive_ttl_secs = 5");
    let output = tk_cmd(&config)
        .arg("run")
        .write_stdin("request guild alice scan\nsleep 1300\nbegin guild alice\n")
        .output()
        .expect("tk run should execute");
    assert!(output.status.success());

    let lines = json_lines(&output.stdout);
    let begin = find(&lines, "begin", "alice");
    assert_eq!(begin[0]["ok"], false);
    assert!(begin[0]["error"].as_str().unwrap().contains("expired"));
    assert!(begin[0]["hint"].as_str().unwrap().contains("Request access again"));

    assert!(lines.iter().any(|v| {
        v["op"] == "notice" && v["notice"]["kind"] == "reservation_expired"
    }));
}

#[test]
fn contract_run_reports_bad_lines_and_continues() {
    let (_dir, config) = write_config("");
    let output = tk_cmd(&config)
        .arg("run")
        .write_stdin("launch guild alice\ncancel guild alice\nstatus\n")
        .output()
        .expect("tk run should execute");
    assert!(output.status.success());

    let lines = json_lines(&output.stdout);
    let parse = lines.iter().find(|v| v["op"] == "parse").expect("parse error line");
    assert_eq!(parse["line"], 1);
    assert!(parse["error"].as_str().unwrap().contains("unknown command"));

    let cancel = find(&lines, "cancel", "alice");
    assert_eq!(cancel[0]["ok"], false);
    assert_eq!(cancel[0]["benign"], true);

    let status = lines.iter().find(|v| v["op"] == "status").expect("status line");
    assert_eq!(status["result"].as_array().map(Vec::len), Some(1));
}

#[test]
fn contract_run_with_board_renders_to_stderr() {
    let (_dir, config) = write_config("");
    tk_cmd(&config)
        .args(["run", "--board"])
        .write_stdin("request guild alice scan\nsleep 50\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("reserved: alice (scan)"));
}
