//! Shell skill gateway
//!
//! Runs the `shell` skill through `sh -c` with a deadline. The process is
//! killed when the deadline passes. Confirmations are denied unless the
//! gateway was built with `auto_approve`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::{Confirmation, Gateway};
use crate::error::CollabError;

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `sh -c <command>` with extra environment, killing it at the deadline
pub async fn run_command(
    command: &str,
    envs: &[(&str, &str)],
    workdir: Option<&PathBuf>,
    timeout: Duration,
) -> Result<CommandOutput, CollabError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    let child = cmd
        .spawn()
        .map_err(|e| CollabError::Unavailable(format!("failed to spawn shell: {}", e)))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(CollabError::Transient(format!("command io error: {}", e))),
        Err(_) => Err(CollabError::Timeout(timeout)),
    }
}

const MAX_OBSERVATION_CHARS: usize = 4000;

/// Gateway exposing the `shell` skill
pub struct ShellGateway {
    workdir: Option<PathBuf>,
    auto_approve: bool,
}

impl ShellGateway {
    pub fn new(workdir: Option<PathBuf>) -> Self {
        Self {
            workdir,
            auto_approve: false,
        }
    }

    /// Approve every confirmation request (unattended hosts only)
    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_OBSERVATION_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(MAX_OBSERVATION_CHARS).collect();
    format!("{}... [truncated]", clipped)
}

#[async_trait]
impl Gateway for ShellGateway {
    async fn invoke(
        &self,
        skill: &str,
        args: &serde_json::Value,
        timeout: Duration,
    ) -> Result<String, CollabError> {
        if skill != "shell" {
            return Err(CollabError::Rejected(format!("unknown skill '{}'", skill)));
        }
        let command = args
            .get("command")
            .and_then(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CollabError::Rejected("shell skill needs a 'command' argument".into()))?;

        let output = run_command(command, &[], self.workdir.as_ref(), timeout).await?;
        if output.success() {
            Ok(clip(output.stdout.trim()))
        } else {
            let message = format!(
                "exit code {}: {}",
                output.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                clip(output.stderr.trim())
            );
            Err(CollabError::from_message(message))
        }
    }

    async fn request_confirmation(&self, action: &str) -> Result<Confirmation, CollabError> {
        if self.auto_approve {
            info!("Auto-approved: {}", action);
            Ok(Confirmation::Approved)
        } else {
            warn!("Confirmation required but no approver attached, denying: {}", action);
            Ok(Confirmation::Denied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_skill_runs() {
        let gw = ShellGateway::new(None);
        let out = gw
            .invoke("shell", &serde_json::json!({"command": "echo hello"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_unknown_skill_rejected() {
        let gw = ShellGateway::new(None);
        let err = gw
            .invoke("browser", &serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let gw = ShellGateway::new(None);
        let err = gw
            .invoke("shell", &serde_json::json!({"command": "sleep 5"}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_confirmation_denied_by_default() {
        let gw = ShellGateway::new(None);
        assert_eq!(gw.request_confirmation("rm -rf /tmp/x").await.unwrap(), Confirmation::Denied);
        let gw = ShellGateway::new(None).with_auto_approve(true);
        assert_eq!(gw.request_confirmation("rm -rf /tmp/x").await.unwrap(), Confirmation::Approved);
    }
}
