//! The command-execution seam.
//!
//! Every external tool invocation (container engine, toolchain, transfer
//! client) goes through [`CommandRunner`] so tests can script the outside
//! world instead of shelling out to it.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use gantry_process::CommandResult;

pub trait CommandRunner {
    fn run(&mut self, program: &str, args: &[&str], cwd: Option<&Path>) -> Result<CommandResult>;
}

/// Runs commands on the host through `gantry-process`, with an optional
/// per-command timeout.
#[derive(Debug, Default)]
pub struct SystemRunner {
    pub timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&mut self, program: &str, args: &[&str], cwd: Option<&Path>) -> Result<CommandResult> {
        gantry_process::run_with_timeout(program, args, cwd, self.timeout)
    }
}

/// Scripted runner for tests: records every call and replays canned
/// results, defaulting to the configured fallback once the script runs dry.
#[cfg(test)]
pub(crate) struct ScriptedRunner {
    pub calls: Vec<(String, Vec<String>)>,
    script: Vec<CommandResult>,
    fallback: CommandResult,
}

#[cfg(test)]
impl ScriptedRunner {
    pub fn succeeding() -> Self {
        Self {
            calls: Vec::new(),
            script: Vec::new(),
            fallback: ok_result(),
        }
    }

    pub fn failing(stderr: &str) -> Self {
        Self {
            calls: Vec::new(),
            script: Vec::new(),
            fallback: failed_result(stderr),
        }
    }

    /// Queue one result; queued results are consumed in order before the
    /// fallback applies.
    pub fn push(&mut self, result: CommandResult) {
        self.script.push(result);
    }

    /// Succeed until the `n`-th call (zero-based), which fails.
    pub fn failing_at(n: usize, stderr: &str) -> Self {
        let mut runner = Self::succeeding();
        for _ in 0..n {
            runner.push(ok_result());
        }
        runner.push(failed_result(stderr));
        runner
    }
}

#[cfg(test)]
impl CommandRunner for ScriptedRunner {
    fn run(&mut self, program: &str, args: &[&str], _cwd: Option<&Path>) -> Result<CommandResult> {
        self.calls.push((
            program.to_string(),
            args.iter().map(|a| a.to_string()).collect(),
        ));
        if self.script.is_empty() {
            Ok(self.fallback.clone())
        } else {
            Ok(self.script.remove(0))
        }
    }
}

#[cfg(test)]
pub(crate) fn ok_result() -> CommandResult {
    CommandResult {
        success: true,
        exit_code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
        timed_out: false,
        duration_ms: 1,
    }
}

#[cfg(test)]
pub(crate) fn failed_result(stderr: &str) -> CommandResult {
    CommandResult {
        success: false,
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
        timed_out: false,
        duration_ms: 1,
    }
}
