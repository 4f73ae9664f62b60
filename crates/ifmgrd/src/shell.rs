//! External command execution for device creation and side-channel queries.
//!
//! Device drivers create kernel links with `ip link add ...` and the naming
//! allocator asks `ovs-vsctl` for the names the virtual switch holds. Both go
//! through [`CommandRunner`] so the engine can be driven without a real host.
//!
//! ```ignore
//! use ifmgrd::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link add name {} type dummy", IP_CMD, shellquote("dummy0"));
//! let result = shell::exec(&cmd).await?;
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::error::{IfmgrError, Result};

/// Path to the `ip` command for link creation.
pub const IP_CMD: &str = "/sbin/ip";

/// Default `ovs-vsctl` binary, looked up in `PATH`.
pub const OVS_VSCTL_CMD: &str = "ovs-vsctl";

/// Characters that need escaping inside shell double quotes: $, `, ", \ and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// ```
/// use ifmgrd::shell::shellquote;
///
/// assert_eq!(shellquote("veth0"), "\"veth0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    /// Successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs command lines on the host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` and report its outcome; a non-zero exit is not an error.
    async fn run(&self, cmd: &str) -> Result<ExecResult>;

    /// Run `cmd` and turn a non-zero exit into [`IfmgrError::Command`].
    async fn run_checked(&self, cmd: &str) -> Result<String> {
        let result = self.run(cmd).await?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(IfmgrError::Command {
                command: cmd.to_string(),
                exit_code: result.exit_code,
                output: result.combined_output(),
            })
        }
    }
}

/// Executes a command through `/bin/sh -c`.
pub async fn exec(cmd: &str) -> Result<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| IfmgrError::CommandSpawn {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::debug!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// [`CommandRunner`] backed by the host shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> Result<ExecResult> {
        exec(cmd).await
    }
}

/// [`CommandRunner`] that records every command and answers from a script.
///
/// Commands without a scripted answer succeed with empty output.
#[derive(Debug, Default, Clone)]
pub struct RecordingRunner {
    commands: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<HashMap<String, ExecResult>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `cmd` with `result` from now on.
    pub fn respond(&self, cmd: impl Into<String>, result: ExecResult) {
        self.responses.lock().insert(cmd.into(), result);
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &str) -> Result<ExecResult> {
        self.commands.lock().push(cmd.to_string());
        Ok(self
            .responses
            .lock()
            .get(cmd)
            .cloned()
            .unwrap_or_default())
    }
}
