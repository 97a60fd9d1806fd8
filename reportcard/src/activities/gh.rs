//! `gh` CLI executor for the profile agent.

use std::time::Duration;

use async_trait::async_trait;

use crate::actors::agent::ProfileCommandExecutor;
use crate::durable::ActivityError;

pub const GH_COMMAND_ERROR: &str = "GhCommandExecutionError";

#[derive(Debug, Clone)]
pub struct GhCommandExecutor {
    binary: String,
    token: Option<String>,
    timeout: Duration,
}

impl GhCommandExecutor {
    pub fn new(token: Option<String>) -> Self {
        Self {
            binary: "gh".to_string(),
            token,
            timeout: Duration::from_secs(60),
        }
    }

    /// Run a different binary with the same argument handling (tests, wrappers).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ProfileCommandExecutor for GhCommandExecutor {
    /// Arguments are the whitespace-separated words of `command`; no shell is involved.
    async fn execute(&self, command: &str) -> Result<String, ActivityError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(command.split_whitespace()).kill_on_drop(true);
        if let Some(token) = &self.token {
            cmd.env("GH_TOKEN", token);
        }

        tracing::debug!(binary = %self.binary, command = %command, "Executing gh command");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ActivityError::retryable(format!(
                    "gh command timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ActivityError::retryable(format!("error executing gh command: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            tracing::info!(command = %command, exit = %code, "gh command failed");
            return Err(ActivityError::non_retryable(
                GH_COMMAND_ERROR,
                format!(
                    "error executing gh command: exit status {code}\nstderr: {}",
                    stderr.trim_end()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
