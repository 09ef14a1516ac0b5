use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use delegtrace::{ReplayTarget, TraceFile, scenario_catalog};

fn temp_workspace(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("delegtrace-cli-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp workspace");
    root
}

fn run_cli(args: &[String]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_delegtrace"))
        .args(args)
        .output()
        .expect("run cli")
}

fn run_cli_with_stdin(args: &[String], stdin: &str) -> std::process::Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_delegtrace"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn cli");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(stdin.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("wait cli")
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn json_stdout(out: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&out.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not json ({e}): {}\nstderr: {}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        )
    })
}

fn write_empty_trace(ws: &std::path::Path, scenario: &str) -> PathBuf {
    let entry = scenario_catalog()
        .into_iter()
        .find(|e| e.name == scenario)
        .expect("scenario");
    let path = ws.join(format!("{scenario}.trace.json"));
    TraceFile::new(
        entry,
        ReplayTarget {
            file_name: "delegtrace.dat".to_string(),
            client_addr: "10.0.0.1".to_string(),
            peer_addr: None,
            server_addr: "10.0.0.2".to_string(),
            file_size: 4096,
        },
        Vec::new(),
    )
    .write_json(&path)
    .expect("write trace");
    path
}

#[test]
fn list_prints_whole_catalog() {
    let out = run_cli(&args(&["list"]));
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout.lines().count(), 19);
    assert!(stdout.lines().any(|l| l.starts_with("basic01")));
    assert!(stdout.lines().any(|l| l.starts_with("recall10")));
}

#[test]
fn list_json_filters_by_glob() {
    let out = run_cli(&args(&["--json", "list", "basic*"]));
    assert!(out.status.success());
    let v = json_stdout(&out);
    let entries = v.as_array().expect("array");
    assert_eq!(entries.len(), 9);
    assert!(entries.iter().all(|e| e["name"].as_str().is_some_and(|n| n.starts_with("basic"))));
}

#[test]
fn list_rejects_bad_glob() {
    let out = run_cli(&args(&["--json", "list", "basic[0"]));
    assert_eq!(out.status.code(), Some(2));
    assert_eq!(json_stdout(&out)["status"], "error");
}

#[test]
fn verify_empty_trace_fails_with_exit_one() {
    let ws = temp_workspace("verify");
    let trace = write_empty_trace(&ws, "basic02");
    let out = run_cli(&args(&["--json", "verify", &trace.display().to_string()]));
    assert_eq!(out.status.code(), Some(1));
    let v = json_stdout(&out);
    assert_eq!(v["status"], "fail");
    assert_eq!(v["name"], "basic02");
    assert_eq!(v["results"].as_array().expect("results").len(), 1);
}

#[test]
fn verify_tampered_trace_is_an_error() {
    let ws = temp_workspace("verify-tampered");
    let trace = write_empty_trace(&ws, "basic01");
    let raw = std::fs::read_to_string(&trace).expect("read trace");
    std::fs::write(&trace, raw.replace("10.0.0.2", "10.0.0.7")).expect("tamper");
    let out = run_cli(&args(&["--json", "verify", &trace.display().to_string()]));
    assert_eq!(out.status.code(), Some(2));
    let v = json_stdout(&out);
    assert!(v["message"].as_str().expect("message").contains("checksum mismatch"));
}

#[test]
fn child_runs_batch_from_stdin() {
    let ws = temp_workspace("child");
    let path = ws.join("delegtrace.dat");
    let batch = serde_json::json!([
        {"op": "open", "handle": 1, "path": path, "mode": "create"},
        {"op": "write", "handle": 1, "offset": 0, "len": 1000},
        {"op": "close", "handle": 1},
        {"op": "open", "handle": 2, "path": path, "mode": "read"},
        {"op": "read", "handle": 2, "offset": 500, "len": 500},
        {"op": "close", "handle": 2}
    ]);
    let out = run_cli_with_stdin(&args(&["child"]), &batch.to_string());
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let v = json_stdout(&out);
    assert_eq!(v["actor"], "child");
    let outcomes = v["outcomes"].as_array().expect("outcomes");
    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|o| o["ok"] == true));
    assert_eq!(std::fs::metadata(&path).expect("file").len(), 1000);
}

#[test]
fn child_reports_failure_with_exit_one() {
    let ws = temp_workspace("child-fail");
    let batch = serde_json::json!([
        {"op": "open", "handle": 1, "path": ws.join("missing"), "mode": "read"},
        {"op": "close", "handle": 1}
    ]);
    let out = run_cli_with_stdin(&args(&["child"]), &batch.to_string());
    assert_eq!(out.status.code(), Some(1));
    let v = json_stdout(&out);
    let outcomes = v["outcomes"].as_array().expect("outcomes");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0]["ok"], false);
}

#[test]
fn run_without_server_is_config_error() {
    let ws = temp_workspace("run-noconfig");
    let out = run_cli(&args(&[
        "--json",
        "--cwd",
        &ws.display().to_string(),
        "run",
        "basic01",
    ]));
    assert_eq!(out.status.code(), Some(2));
    let v = json_stdout(&out);
    assert!(v["message"].as_str().expect("message").contains("`server` is not set"));
}

#[test]
fn version_json_has_version() {
    let out = run_cli(&args(&["--json", "version"]));
    assert!(out.status.success());
    let v = json_stdout(&out);
    assert!(v["version"].as_str().is_some_and(|s| !s.is_empty()));
}

#[test]
fn env_reports_capabilities() {
    let ws = temp_workspace("env");
    let out = run_cli(&args(&["--json", "--cwd", &ws.display().to_string(), "env"]));
    assert!(out.status.success());
    let v = json_stdout(&out);
    assert!(v["capabilities"].is_object());
}
