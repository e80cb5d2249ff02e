//! Process execution for gantry.
//!
//! Every external tool gantry touches (the container engine, the Rust
//! toolchain, the secure-copy client) is driven through this crate: spawn,
//! capture stdout/stderr, and report a uniform [`CommandResult`]. A
//! non-zero exit never panics and never raises by itself; callers decide
//! whether a failed command is fatal.
//!
//! # Example
//!
//! ```ignore
//! use gantry_process::run;
//!
//! let result = run("cargo", &["--version"])?;
//! assert!(result.success);
//! assert!(result.stdout.contains("cargo"));
//! ```

use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Outcome of one external command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command exited with status 0.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the command was killed by a timeout.
    pub timed_out: bool,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
}

impl CommandResult {
    /// Turn a failed result into an error carrying the captured stderr.
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else if self.timed_out {
            Err(anyhow::anyhow!("command timed out: {}", self.stderr.trim()))
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                self.stderr.trim()
            ))
        }
    }

    fn from_output(output: &Output, duration: Duration) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Run a command in the current directory and capture its output.
pub fn run(program: &str, args: &[&str]) -> Result<CommandResult> {
    run_with_timeout(program, args, None, None)
}

/// Run a command in `dir` and capture its output.
pub fn run_in(program: &str, args: &[&str], dir: &Path) -> Result<CommandResult> {
    run_with_timeout(program, args, Some(dir), None)
}

/// Run a command with an optional working directory and an optional
/// wall-clock timeout. On timeout the child is killed and the result is
/// marked `timed_out` with exit code `None`.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    dir: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<CommandResult> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    let Some(timeout) = timeout else {
        let output = command
            .output()
            .with_context(|| format!("failed to run command: {program} {args:?}"))?;
        return Ok(CommandResult::from_output(&output, start.elapsed()));
    };

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn command: {program} {args:?}"))?;

    let deadline = start + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to poll command")? {
            let (stdout, stderr) = drain_pipes(&mut child);
            return Ok(CommandResult {
                success: status.success(),
                exit_code: status.code(),
                stdout,
                stderr,
                timed_out: false,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let (stdout, mut stderr) = drain_pipes(&mut child);
            stderr.push_str(&format!("\ncommand killed after {}ms", timeout.as_millis()));
            return Ok(CommandResult {
                success: false,
                exit_code: None,
                stdout,
                stderr,
                timed_out: true,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}

fn drain_pipes(child: &mut std::process::Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}
