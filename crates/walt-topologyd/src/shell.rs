//! Asynchronous execution of the LLDP and SNMP tools.

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Result, TopologyError};

/// Path to the LLDP agent query tool.
pub const LLDPCTL_CMD: &str = "lldpctl";

/// Path to the LLDP agent control tool.
pub const LLDPCLI_CMD: &str = "lldpcli";

/// Path to the SNMP walk tool.
pub const SNMPWALK_CMD: &str = "snmpwalk";

/// Characters that need escaping inside shell double quotes.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short failure description for logs and discovery errors.
    pub fn failure_reason(&self) -> String {
        if self.stderr.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            format!("exit code {}: {}", self.exit_code, self.stderr)
        }
    }
}

/// Executes a command line through `/bin/sh -c`.
///
/// Only spawn failures are errors; a non-zero exit code is reported in the
/// returned [`ExecResult`].
pub async fn exec(cmd: &str) -> Result<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| TopologyError::Command {
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
