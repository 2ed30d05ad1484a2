//! CLI tests for `loopctl hook` and `loopctl status`.
//!
//! Spawns the binary the way a host stop hook does: JSON on stdin, decision
//! JSON on stdout, exit code 0.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use loopctl::exit_codes;
use loopctl::test_support::{Sandbox, checklist};
use serde_json::Value;

fn loopctl(sb: &Sandbox) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_loopctl"));
    cmd.env("LOOPCTL_STATE_DIR", &sb.state_dir)
        .env("LOOPCTL_GLOBAL_CONFIG", sb.state_dir.join("no-global.toml"))
        .env_remove("RUST_LOG");
    cmd
}

fn run_hook(sb: &Sandbox, stdin: &str) -> Output {
    let mut child = loopctl(sb)
        .arg("hook")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn loopctl hook");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(stdin.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("wait loopctl hook")
}

fn hook_input(project: &Path, session: &str) -> String {
    serde_json::json!({
        "session_id": session,
        "cwd": project,
        "hook_event_name": "Stop",
        "stop_hook_active": false
    })
    .to_string()
}

fn decision(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("decision json on stdout")
}

#[test]
fn hook_blocks_with_prompt_on_stdout() {
    let sb = Sandbox::new();
    sb.write("TASK.md", &checklist(1, 2));

    let output = run_hook(&sb, &hook_input(&sb.project, "cli-1"));

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let value = decision(&output);
    assert_eq!(value["decision"], "block");
    let reason = value["reason"].as_str().expect("reason");
    assert!(reason.contains("IMPLEMENTATION (iteration 1)"));
    assert!(reason.contains("pending 0"));
    assert!(value.get("backoff_seconds").is_none());
}

#[test]
fn hook_allows_stop_when_kill_switch_present() {
    let sb = Sandbox::new();
    sb.kill();

    let output = run_hook(&sb, &hook_input(&sb.project, "cli-2"));

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "{}");
}

#[test]
fn invalid_hook_input_still_yields_a_decision() {
    let sb = Sandbox::new();

    let output = loopctl(&sb)
        .current_dir(&sb.project)
        .args(["hook", "--session", "cli-3"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            child
                .stdin
                .take()
                .expect("stdin")
                .write_all(b"not json")?;
            child.wait_with_output()
        })
        .expect("run loopctl hook");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(decision(&output)["decision"], "block");
}

#[test]
fn status_reports_session_after_hook() {
    let sb = Sandbox::new();
    run_hook(&sb, &hook_input(&sb.project, "cli-4"));

    let output = loopctl(&sb)
        .args(["status", "--session", "cli-4", "--project"])
        .arg(&sb.project)
        .output()
        .expect("loopctl status");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("mode:        IMPLEMENTATION"));
    assert!(text.contains("iteration:   1"));

    let listing = loopctl(&sb)
        .args(["status", "--project"])
        .arg(&sb.project)
        .output()
        .expect("loopctl status list");
    assert!(String::from_utf8_lossy(&listing.stdout).contains("-cli-4"));
}

#[test]
fn status_for_unknown_session_is_invalid() {
    let sb = Sandbox::new();

    let output = loopctl(&sb)
        .args(["status", "--session", "missing", "--project"])
        .arg(&sb.project)
        .output()
        .expect("loopctl status");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no state for session missing"));
}
