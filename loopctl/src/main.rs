//! Stop-hook loop controller.
//!
//! `loopctl hook` is invoked by the host tool whenever the agent tries to end
//! its turn and prints the decision as JSON on stdout. `loopctl status` shows
//! what a session has persisted so far.

use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, warn};

use loopctl::core::types::Decision;
use loopctl::exit_codes;
use loopctl::hook::{HookRequest, run_hook};
use loopctl::io::checks::CommandCheckRunner;
use loopctl::io::kill_switch::active_kill_switch;
use loopctl::io::paths::{
    SessionPaths, canonical_project_dir, default_global_config_path, default_state_dir,
    project_path_hash,
};
use loopctl::io::prompt::FALLBACK_PROMPT;
use loopctl::logging;
use loopctl::status::{project_sessions, render_status, session_status};

const DEFAULT_SESSION: &str = "default";

#[derive(Parser)]
#[command(
    name = "loopctl",
    version,
    about = "Stop-hook loop controller for autonomous agent sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decide whether the agent may stop; reads the host's hook JSON from stdin.
    Hook(HookArgs),
    /// Print the persisted state of a session, or list the project's sessions.
    Status(StatusArgs),
}

#[derive(Args)]
struct HookArgs {
    /// Project directory (defaults to the hook input's `cwd`, then the current directory).
    #[arg(long)]
    project: Option<PathBuf>,
    /// Session id (defaults to the hook input's `session_id`).
    #[arg(long)]
    session: Option<String>,
    /// Task artifact to scan for completion signals.
    #[arg(long)]
    artifact: Option<PathBuf>,
    /// Host transcript (JSONL) used for repetition detection.
    #[arg(long)]
    transcript: Option<PathBuf>,
    #[arg(long, env = "LOOPCTL_STATE_DIR")]
    state_dir: Option<PathBuf>,
    #[arg(long, env = "LOOPCTL_GLOBAL_CONFIG")]
    global_config: Option<PathBuf>,
    /// Do not read hook JSON from stdin.
    #[arg(long)]
    no_stdin: bool,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// Session id; without it the project's sessions are listed.
    #[arg(long)]
    session: Option<String>,
    #[arg(long, env = "LOOPCTL_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

/// Fields the host passes to stop hooks on stdin. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostInput {
    session_id: Option<String>,
    cwd: Option<PathBuf>,
    transcript_path: Option<PathBuf>,
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Hook(args) => cmd_hook(args),
        Command::Status(args) => match cmd_status(args) {
            Ok(()) => exit_codes::OK,
            Err(err) => {
                eprintln!("{err:#}");
                exit_codes::INVALID
            }
        },
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Always prints a decision and exits 0.
fn cmd_hook(args: HookArgs) -> i32 {
    let input = if args.no_stdin {
        HostInput::default()
    } else {
        read_host_input()
    };
    let request = build_request(args, input);
    let decision = match run_hook(&request, &CommandCheckRunner) {
        Ok(outcome) => outcome.decision,
        Err(err) => {
            error!(err = %format!("{err:#}"), "hook failed, falling back");
            fallback_decision(&request)
        }
    };
    println!("{}", decision.to_json());
    exit_codes::OK
}

fn read_host_input() -> HostInput {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return HostInput::default();
    }
    let mut raw = String::new();
    if let Err(err) = stdin.read_to_string(&mut raw) {
        warn!(err = %err, "failed to read hook input");
        return HostInput::default();
    }
    if raw.trim().is_empty() {
        return HostInput::default();
    }
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!(err = %err, "hook input is not valid JSON");
        HostInput::default()
    })
}

fn build_request(args: HookArgs, input: HostInput) -> HookRequest {
    let project_dir = args
        .project
        .or(input.cwd)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let session_id = args
        .session
        .or(input.session_id)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION.to_string());
    HookRequest {
        project_dir,
        session_id,
        artifact: args.artifact,
        transcript: args.transcript.or(input.transcript_path),
        state_dir: args.state_dir.unwrap_or_else(default_state_dir),
        global_config: args.global_config.or_else(default_global_config_path),
        now: Utc::now(),
    }
}

/// Kill switch still wins; otherwise keep the agent going with a generic nudge.
fn fallback_decision(request: &HookRequest) -> Decision {
    let killed = SessionPaths::new(&request.project_dir, &request.session_id, &request.state_dir)
        .ok()
        .and_then(|paths| active_kill_switch(&paths));
    match killed {
        Some(marker) => Decision::AllowStop {
            reason: format!("kill switch present ({})", marker.display()),
        },
        None => Decision::Block {
            prompt: FALLBACK_PROMPT.to_string(),
            backoff_seconds: 0,
        },
    }
}

fn cmd_status(args: StatusArgs) -> Result<()> {
    let state_dir = args.state_dir.unwrap_or_else(default_state_dir);
    match args.session {
        Some(session) => {
            let paths = SessionPaths::new(&args.project, &session, &state_dir)?;
            let status = session_status(&paths, Utc::now())?;
            print!("{}", render_status(&status));
        }
        None => {
            let sessions = list_sessions(&args.project, &state_dir)?;
            if sessions.is_empty() {
                println!("no sessions for {}", args.project.display());
            }
            for session in sessions {
                println!("{session}");
            }
        }
    }
    Ok(())
}

fn list_sessions(project: &Path, state_dir: &Path) -> Result<Vec<String>> {
    let hash = project_path_hash(&canonical_project_dir(project));
    project_sessions(state_dir, &hash)
        .with_context(|| format!("list sessions in {}", state_dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hook_flags() {
        let cli = Cli::parse_from([
            "loopctl",
            "hook",
            "--project",
            "/p",
            "--session",
            "s1",
            "--no-stdin",
        ]);
        let Command::Hook(args) = cli.command else {
            panic!("expected hook");
        };
        assert_eq!(args.project, Some(PathBuf::from("/p")));
        assert_eq!(args.session.as_deref(), Some("s1"));
        assert!(args.no_stdin);
    }

    #[test]
    fn flags_override_host_input() {
        let cli = Cli::parse_from(["loopctl", "hook", "--session", "flag", "--state-dir", "/s"]);
        let Command::Hook(args) = cli.command else {
            panic!("expected hook");
        };
        let input: HostInput = serde_json::from_str(
            r#"{"session_id":"host","cwd":"/work","transcript_path":"/t.jsonl","hook_event_name":"Stop"}"#,
        )
        .expect("input");
        let request = build_request(args, input);
        assert_eq!(request.session_id, "flag");
        assert_eq!(request.project_dir, PathBuf::from("/work"));
        assert_eq!(request.transcript, Some(PathBuf::from("/t.jsonl")));
        assert_eq!(request.state_dir, PathBuf::from("/s"));
    }

    #[test]
    fn fallback_blocks_unless_killed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = HookRequest {
            project_dir: temp.path().to_path_buf(),
            session_id: "s".to_string(),
            artifact: None,
            transcript: None,
            state_dir: temp.path().join("state"),
            global_config: None,
            now: Utc::now(),
        };
        assert!(fallback_decision(&request).is_block());

        std::fs::create_dir_all(temp.path().join(".loopctl")).expect("mkdir");
        std::fs::write(temp.path().join(".loopctl").join("STOP"), "").expect("touch");
        assert!(!fallback_decision(&request).is_block());
    }
}
