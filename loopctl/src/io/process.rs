//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long pipe threads may lag behind the child before its process group is killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and output is read on helper threads while the child runs, so the timeout
/// starts at spawn. `output_limit_bytes` bounds the amount of stdout/stderr stored in memory
/// (bytes beyond this are discarded while still draining the pipe).
///
/// On unix the child leads its own process group. A timed-out child is killed together with
/// its descendants and reaped before returning. Descendants that keep the pipes open after
/// the child exits are killed once `DRAIN_GRACE` runs out.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                // A child that exits without reading its input closes the pipe early.
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    if !wait_for_threads(&stdout_handle, &stderr_handle, stdin_handle.as_ref()) {
        warn!("descendants still hold the child's pipes, killing process group");
        kill_process_group(&mut child);
        if !wait_for_threads(&stdout_handle, &stderr_handle, stdin_handle.as_ref()) {
            warn!("abandoning pipe threads of escaped descendants");
        }
    }

    if let Some(handle) = stdin_handle
        && handle.is_finished()
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Poll until every pipe thread is done or `DRAIN_GRACE` elapses. True when all finished.
fn wait_for_threads<A, B, C>(
    stdout: &thread::JoinHandle<A>,
    stderr: &thread::JoinHandle<B>,
    stdin: Option<&thread::JoinHandle<C>>,
) -> bool {
    let deadline = Instant::now() + DRAIN_GRACE;
    loop {
        let done = stdout.is_finished()
            && stderr.is_finished()
            && stdin.is_none_or(thread::JoinHandle::is_finished);
        if done {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Kill the child and everything in its process group. Errors mean it is already gone.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pgid) = i32::try_from(child.id())
            && let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL)
        {
            debug!(err = %e, "process group already gone");
        }
    }
    if let Err(e) = child.kill() {
        debug!(err = %e, "child already gone");
    }
}

/// Output of a finished reader thread. A still-blocked reader is detached and yields nothing.
fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    if !handle.is_finished() {
        return Ok((Vec::new(), 0));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let out = run_command_with_timeout(
            sh("echo hi; exit 3"),
            None,
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert_eq!(out.stdout_lossy().trim(), "hi");
        assert_eq!(out.status.code(), Some(3));
        assert!(!out.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command_with_timeout(
            sh("cat"),
            Some(b"payload"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert_eq!(out.stdout_lossy(), "payload");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_timeout(
            sh("exec sleep 5"),
            None,
            Duration::from_millis(100),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
    }

    #[test]
    fn unread_stdin_does_not_delay_the_timeout() {
        let input = vec![b'x'; 256 * 1024];
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("exec sleep 4"),
            Some(&input),
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn timeout_kills_forked_descendants() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 4; echo late"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.stdout_lossy().contains("late"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn background_descendant_does_not_hold_the_pipes() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 4 & echo done"),
            None,
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.stdout_lossy().trim(), "done");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(5),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
    }
}
