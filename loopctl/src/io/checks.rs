//! Validation check runners.
//!
//! A check is an external command. It reports either structured lines on
//! stdout (`{"status":"pass"|"fail","message":...}` or `PASS ...`/`FAIL ...`)
//! or, failing that, just its exit status.

use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::types::{CheckResult, CheckStatus};
use crate::core::validation::FINAL_ROUND;
use crate::io::process::run_command_with_timeout;

/// Findings reported from a failing check's raw output.
const MAX_FALLBACK_FINDINGS: usize = 5;

fn default_weight() -> f64 {
    1.0
}

/// Configured validation check (`[[validation.checks]]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckSpec {
    pub name: String,
    /// Round the check belongs to (1..=3).
    pub round: u8,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl CheckSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("check name must not be empty"));
        }
        if self.round == 0 || self.round > FINAL_ROUND {
            return Err(anyhow!(
                "check '{}' has round {} (expected 1..={FINAL_ROUND})",
                self.name,
                self.round
            ));
        }
        if self.command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("check '{}' has an empty command", self.name));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(anyhow!(
                "check '{}' has invalid weight {}",
                self.name,
                self.weight
            ));
        }
        Ok(())
    }
}

/// Everything a check needs besides its own spec.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub project_dir: PathBuf,
    pub session_id: String,
    /// Round the check runs in (may differ from the configured round on re-verification).
    pub round: u8,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Findings from the previous round, fed to round-2 checks.
    pub findings: Vec<String>,
}

pub trait CheckRunner {
    fn run(&self, spec: &CheckSpec, request: &CheckRequest) -> Result<CheckResult>;
}

/// Runs checks as subprocesses in the project directory.
pub struct CommandCheckRunner;

impl CheckRunner for CommandCheckRunner {
    fn run(&self, spec: &CheckSpec, request: &CheckRequest) -> Result<CheckResult> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| anyhow!("check '{}' has an empty command", spec.name))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.project_dir)
            .env("LOOPCTL_ROUND", request.round.to_string())
            .env("LOOPCTL_PROJECT", &request.project_dir)
            .env("LOOPCTL_SESSION", &request.session_id);

        let findings_input =
            (!request.findings.is_empty()).then(|| findings_ndjson(&request.findings));
        if let Some(input) = &findings_input {
            cmd.env("LOOPCTL_FINDINGS", input);
        }

        let started = Instant::now();
        let result = run_command_with_timeout(
            cmd,
            findings_input.as_deref().map(str::as_bytes),
            request.timeout,
            request.output_limit_bytes,
        );
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (status, findings) = match result {
            Err(err) => (
                CheckStatus::Errored {
                    message: format!("{err:#}"),
                },
                Vec::new(),
            ),
            Ok(out) if out.timed_out => (CheckStatus::TimedOut, Vec::new()),
            Ok(out) => {
                let parsed = parse_check_output(&out.stdout_lossy());
                match parsed {
                    Some(parsed) => (
                        CheckStatus::Completed {
                            pass_rate: parsed.pass_rate,
                        },
                        parsed.findings,
                    ),
                    None if out.status.success() => {
                        (CheckStatus::Completed { pass_rate: 1.0 }, Vec::new())
                    }
                    None => (
                        CheckStatus::Completed { pass_rate: 0.0 },
                        fallback_findings(&out.stdout_lossy(), &out.stderr_lossy()),
                    ),
                }
            }
        };
        debug!(
            check = %spec.name,
            round = request.round,
            ?status,
            duration_ms,
            "check finished"
        );

        Ok(CheckResult {
            name: spec.name.clone(),
            round: request.round,
            weight: spec.weight,
            status,
            findings,
            duration_ms,
        })
    }
}

/// Structured result lines parsed from check stdout.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCheckOutput {
    pub pass_rate: f64,
    pub findings: Vec<String>,
}

/// Parse structured PASS/FAIL lines. `None` when the output has none.
pub fn parse_check_output(stdout: &str) -> Option<ParsedCheckOutput> {
    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut findings = Vec::new();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((pass, message)) = parse_json_line(line).or_else(|| parse_prefixed_line(line))
        else {
            continue;
        };
        if pass {
            passed += 1;
        } else {
            failed += 1;
            findings.push(if message.is_empty() {
                "check reported a failure".to_string()
            } else {
                message
            });
        }
    }

    let total = passed + failed;
    if total == 0 {
        return None;
    }
    Some(ParsedCheckOutput {
        pass_rate: passed as f64 / total as f64,
        findings,
    })
}

fn parse_json_line(line: &str) -> Option<(bool, String)> {
    let value: Value = serde_json::from_str(line).ok()?;
    let status = value.get("status")?.as_str()?.to_ascii_lowercase();
    let pass = match status.as_str() {
        "pass" | "passed" | "ok" => true,
        "fail" | "failed" | "error" => false,
        _ => return None,
    };
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    Some((pass, message))
}

fn parse_prefixed_line(line: &str) -> Option<(bool, String)> {
    for (prefix, pass) in [("PASS", true), ("FAIL", false)] {
        let Some(rest) = line.strip_prefix(prefix) else {
            continue;
        };
        if !(rest.is_empty() || rest.starts_with([':', ' ', '\t', '-'])) {
            continue;
        }
        let message = rest.trim_start_matches([':', ' ', '\t', '-']).trim();
        return Some((pass, message.to_string()));
    }
    None
}

fn fallback_findings(stdout: &str, stderr: &str) -> Vec<String> {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = source
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(MAX_FALLBACK_FINDINGS);
    let mut findings: Vec<String> = lines[start..].iter().map(|l| (*l).to_string()).collect();
    if findings.is_empty() {
        findings.push("check exited with a failure status".to_string());
    }
    findings
}

fn findings_ndjson(findings: &[String]) -> String {
    let mut out = String::new();
    for finding in findings {
        out.push_str(&serde_json::json!({ "finding": finding }).to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &[&str]) -> CheckSpec {
        CheckSpec {
            name: "probe".to_string(),
            round: 1,
            command: command.iter().map(|s| (*s).to_string()).collect(),
            weight: 1.0,
        }
    }

    fn request(dir: &std::path::Path) -> CheckRequest {
        CheckRequest {
            project_dir: dir.to_path_buf(),
            session_id: "s".to_string(),
            round: 1,
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            findings: Vec::new(),
        }
    }

    #[test]
    fn parses_json_and_prefixed_lines() {
        let out = "noise\n{\"status\":\"pass\"}\nFAIL: missing docs\nPASS\n{\"status\":\"fail\",\"message\":\"slow test\"}\n";
        let parsed = parse_check_output(out).expect("structured");
        assert_eq!(parsed.pass_rate, 0.5);
        assert_eq!(parsed.findings, vec!["missing docs", "slow test"]);
    }

    #[test]
    fn prefix_must_be_a_word() {
        assert!(parse_check_output("PASSWORD reset\nFAILURE mode").is_none());
    }

    #[test]
    fn validate_rejects_bad_specs() {
        assert!(spec(&["true"]).validate().is_ok());
        assert!(spec(&[]).validate().is_err());
        let mut bad_round = spec(&["true"]);
        bad_round.round = 4;
        assert!(bad_round.validate().is_err());
        let mut bad_weight = spec(&["true"]);
        bad_weight.weight = -1.0;
        assert!(bad_weight.validate().is_err());
    }

    #[test]
    fn exit_status_decides_without_structured_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ok = CommandCheckRunner
            .run(&spec(&["sh", "-c", "echo fine"]), &request(temp.path()))
            .expect("run");
        assert_eq!(ok.pass_rate(), Some(1.0));

        let failed = CommandCheckRunner
            .run(
                &spec(&["sh", "-c", "echo broken >&2; exit 1"]),
                &request(temp.path()),
            )
            .expect("run");
        assert_eq!(failed.pass_rate(), Some(0.0));
        assert_eq!(failed.findings, vec!["broken"]);
    }

    #[test]
    fn spawn_failure_is_errored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = CommandCheckRunner
            .run(
                &spec(&["/definitely/not/a/binary"]),
                &request(temp.path()),
            )
            .expect("run");
        assert!(matches!(result.status, CheckStatus::Errored { .. }));
    }

    #[test]
    fn timeout_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path());
        req.timeout = Duration::from_millis(100);
        let result = CommandCheckRunner
            .run(&spec(&["sh", "-c", "exec sleep 5"]), &req)
            .expect("run");
        assert_eq!(result.status, CheckStatus::TimedOut);
    }

    #[test]
    fn check_ignoring_a_large_findings_payload_still_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path());
        req.round = 2;
        req.timeout = Duration::from_millis(300);
        req.findings = (0..2000)
            .map(|i| format!("[lint] finding {i:04} in src/module.rs"))
            .collect();
        let started = Instant::now();
        let result = CommandCheckRunner
            .run(&spec(&["sh", "-c", "exec sleep 4"]), &req)
            .expect("run");
        assert_eq!(result.status, CheckStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn timeout_covers_commands_that_fork() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path());
        req.timeout = Duration::from_millis(300);
        let started = Instant::now();
        let result = CommandCheckRunner
            .run(&spec(&["sh", "-c", "sleep 4; echo PASS done"]), &req)
            .expect("run");
        assert_eq!(result.status, CheckStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn findings_reach_the_check_on_stdin_and_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path());
        req.round = 2;
        req.findings = vec!["[lint] unused".to_string()];
        let result = CommandCheckRunner
            .run(
                &spec(&[
                    "sh",
                    "-c",
                    "grep -q unused && test \"$LOOPCTL_ROUND\" = 2 && test -n \"$LOOPCTL_FINDINGS\"",
                ]),
                &req,
            )
            .expect("run");
        assert_eq!(result.pass_rate(), Some(1.0));
        assert_eq!(result.round, 2);
    }
}
