// CLI integration tests: help, smoke, and the add/query/get flow against the emulator.
mod common;

use std::process::{Command, Output};

use common::{TestResult, TestServer};
use serde_json::{Value, json};

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_rtchat");
    let mut command = Command::new(exe);
    command
        .env_remove("RTCHAT_DATABASE_URL")
        .env_remove("RTCHAT_AUTH_TOKEN")
        .env("RUST_LOG", "warn");
    command
}

fn against(server: &TestServer) -> Command {
    let mut command = cmd();
    command.env("RTCHAT_DATABASE_URL", &server.base_url);
    command
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn stdout_json(output: &Output) -> Value {
    parse_json(String::from_utf8_lossy(&output.stdout).trim())
}

#[test]
fn help_exits_zero() {
    let output = cmd().arg("--help").output().expect("help");
    assert_eq!(output.status.code(), Some(0));
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("smoke"));
    assert!(text.contains("serve"));
}

#[test]
fn missing_database_url_is_a_usage_error() {
    let output = cmd().args(["list"]).output().expect("list");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(String::from_utf8_lossy(&output.stderr).trim());
    assert_eq!(err["error"]["kind"], json!("Usage"));
    assert!(err["error"]["hint"].as_str().is_some_and(|hint| hint.contains("RTCHAT_DATABASE_URL")));
}

#[test]
fn bad_arguments_are_usage_errors() {
    let output = cmd().args(["list", "--limit", "many"]).output().expect("list");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn smoke_passes_against_emulator() -> TestResult<()> {
    let server = TestServer::start()?;
    let output = against(&server).arg("smoke").output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "stdout: {stdout}");
    assert!(stdout.contains("All smoke checks passed."));

    let output = against(&server).args(["query", "--user", "user123"]).output()?;
    assert_eq!(output.status.code(), Some(0));
    let records = stdout_json(&output);
    assert_eq!(records.as_array().map(Vec::len), Some(1));
    assert_eq!(records[0]["users"], json!(["user123", "user456"]));
    Ok(())
}

#[test]
fn smoke_fails_with_exit_one_when_unreachable() {
    let output = cmd()
        .args(["--database-url", "http://127.0.0.1:1", "smoke"])
        .output()
        .expect("smoke");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: Io:"), "stderr: {stderr}");
}

#[test]
fn add_query_and_get_flow() -> TestResult<()> {
    let server = TestServer::start()?;

    let output = against(&server)
        .args(["add", "--in", "log", "--key", "123", r#"{"sender": "u1", "t": 5}"#])
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output), json!({"key": "123", "path": "/chat_v2/123"}));

    let output = against(&server)
        .args(["add", r#"{"users": ["u1", "u2"], "t": 2}"#])
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    let generated = stdout_json(&output)["key"]
        .as_str()
        .map(str::to_string)
        .expect("generated key");
    assert_eq!(generated.len(), 20);

    let output = against(&server).args(["get", "123"]).output()?;
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output), json!({"key": "123", "sender": "u1", "t": 5}));

    let output = against(&server)
        .args(["query", "--in", "log", "--where", "t>=5", "--where", "sender==u1"])
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output), json!([{"key": "123", "sender": "u1", "t": 5}]));

    let output = against(&server).args(["list", "--limit", "5"]).output()?;
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)[0]["key"], json!(generated));

    let output = against(&server).args(["get", "missing"]).output()?;
    assert_eq!(output.status.code(), Some(3));
    Ok(())
}

#[test]
fn invalid_payload_is_rejected_before_connecting() {
    let output = cmd()
        .args(["--database-url", "http://127.0.0.1:1", "add", "{nope"])
        .output()
        .expect("add");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn watch_emits_json_lines_until_timeout() -> TestResult<()> {
    let server = TestServer::start()?;
    against(&server)
        .args(["add", "--key", "a", r#"{"users": ["u1"]}"#])
        .output()?;

    let output = against(&server)
        .args(["watch", "--json", "--timeout", "1s"])
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    let text = String::from_utf8_lossy(&output.stdout);
    let first = parse_json(text.lines().next().expect("initial event"));
    assert_eq!(first["event"], json!("put"));
    assert_eq!(first["path"], json!("/"));
    assert_eq!(first["location"], json!("chats_v2"));
    assert_eq!(first["data"], json!({"a": {"users": ["u1"]}}));
    Ok(())
}

#[test]
fn serve_loads_seed_file() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let seed = temp.path().join("seed.json");
    std::fs::write(
        &seed,
        r#"{"chat_v2": {"123": {"sender": "u1", "text": "seeded"}}, "chats_v2": {"a": {"users": ["user123"]}}}"#,
    )?;
    let seed_arg = seed.to_string_lossy().to_string();
    let server = TestServer::start_with_args(&["--seed", &seed_arg])?;

    let output = against(&server).args(["get", "123"]).output()?;
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["text"], json!("seeded"));

    let output = against(&server).args(["list", "--in", "chats"]).output()?;
    assert_eq!(stdout_json(&output), json!([{"key": "a", "users": ["user123"]}]));
    Ok(())
}
