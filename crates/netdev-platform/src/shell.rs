//! Shell command execution for the Linux backend.
//!
//! Interface names come from connection profiles, so every argument that
//! reaches `/bin/sh` is quoted with [`shellquote`].
//!
//! # Example
//!
//! ```ignore
//! use netdev_platform::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link set dev {} up", IP_CMD, shellquote("eth0"));
//! shell::exec_or_err(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{PlatformError, PlatformResult};

/// Path to the `ip` command.
pub const IP_CMD: &str = "/sbin/ip";

/// Characters with special meaning inside shell double quotes:
/// `$`, `` ` ``, `"`, `\` and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// # Example
///
/// ```
/// use netdev_platform::shell::shellquote;
///
/// assert_eq!(shellquote("bond0"), "\"bond0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Builds `ip link add <name> type <kind>`.
pub fn build_link_add_cmd(name: &str, kind: &str) -> String {
    format!("{} link add {} type {}", IP_CMD, shellquote(name), kind)
}

/// Builds `ip link del dev <name>`.
pub fn build_link_del_cmd(name: &str) -> String {
    format!("{} link del dev {}", IP_CMD, shellquote(name))
}

/// Builds `ip link set dev <slave> master <master>`.
pub fn build_enslave_cmd(master: &str, slave: &str) -> String {
    format!(
        "{} link set dev {} master {}",
        IP_CMD,
        shellquote(slave),
        shellquote(master)
    )
}

/// Builds `ip link set dev <slave> nomaster`.
pub fn build_release_cmd(slave: &str) -> String {
    format!("{} link set dev {} nomaster", IP_CMD, shellquote(slave))
}

/// Builds `ip link set dev <name> up|down`.
pub fn build_link_admin_cmd(name: &str, up: bool) -> String {
    format!(
        "{} link set dev {} {}",
        IP_CMD,
        shellquote(name),
        if up { "up" } else { "down" }
    )
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output.
    pub stdout: String,
    /// The stderr output.
    pub stderr: String,
}

impl ExecResult {
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

/// Executes a shell command through `/bin/sh -c`.
///
/// Returns `Err` only when the command could not be spawned; a non-zero exit
/// is reported through [`ExecResult::exit_code`].
pub async fn exec(cmd: &str) -> PlatformResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PlatformError::ShellExec {
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
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and turns a non-zero exit into an error.
pub async fn exec_or_err(cmd: &str) -> PlatformResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(PlatformError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
