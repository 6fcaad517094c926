//! Child processes with a timeout and bounded captured output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported for a command killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

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
    /// `124` on timeout, `-1` when killed by a signal.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        self.status.code().unwrap_or(-1)
    }

    /// Trimmed stderr, or trimmed stdout when stderr is empty.
    pub fn error_text(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if !stderr.is_empty() {
            return stderr;
        }
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Everything needed to spawn one bounded child.
#[derive(Debug, Clone)]
pub struct ProcessRequest<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub workdir: &'a Path,
    pub env: &'a [(String, String)],
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Run a command with a timeout, draining stdout/stderr concurrently so the
/// child can never block on a full pipe. Bytes past `output_limit_bytes` are
/// counted and discarded.
#[instrument(skip_all, fields(program = request.program, timeout_secs = request.timeout.as_secs()))]
pub fn run_with_timeout(request: &ProcessRequest<'_>) -> Result<CommandOutput> {
    let mut cmd = Command::new(request.program);
    cmd.args(request.args)
        .current_dir(request.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in request.env {
        cmd.env(key, value);
    }

    debug!("spawning child process");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", request.program))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = request.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let mut timed_out = false;
    let status = match child.wait_timeout(request.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

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

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
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
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration, limit: usize) -> CommandOutput {
        let temp = tempfile::tempdir().expect("tempdir");
        let args = vec!["-c".to_string(), script.to_string()];
        run_with_timeout(&ProcessRequest {
            program: "sh",
            args: &args,
            workdir: temp.path(),
            env: &[("GREETING".to_string(), "hi".to_string())],
            timeout,
            output_limit_bytes: limit,
        })
        .expect("run")
    }

    #[test]
    fn captures_exit_code_and_env() {
        let out = sh("echo $GREETING; echo oops >&2; exit 3", Duration::from_secs(10), 1024);
        assert_eq!(out.exit_code(), 3);
        assert_eq!(String::from_utf8_lossy(&out.stdout), "hi\n");
        assert_eq!(out.error_text(), "oops");
    }

    #[test]
    fn timeout_reports_124() {
        let out = sh("sleep 5", Duration::from_millis(200), 1024);
        assert!(out.timed_out);
        assert_eq!(out.exit_code(), TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn output_is_bounded() {
        let out = sh("printf 'abcdefghij'", Duration::from_secs(10), 4);
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
    }
}
