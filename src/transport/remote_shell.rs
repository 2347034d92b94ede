//! Remote command execution.
//!
//! Commands run on the target host through the system `ssh` client in batch
//! mode, or locally through `sh -c` when no host is configured. ssh reserves
//! exit status 255 for its own failures; those are classified into
//! [`TransportError`]s, every other status belongs to the remote command.

use super::{Transport, TransportKind};
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const SSH_FAILURE_STATUS: i32 = 255;

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
enum Target {
    Local,
    Ssh { destination: String },
}

/// Remote shell adapter bound to one host.
#[derive(Debug, Clone)]
pub struct RemoteShellTransport {
    target: Target,
    endpoint: String,
    timeout: Duration,
}

impl RemoteShellTransport {
    /// Run commands on `host` via ssh, optionally as `user`.
    pub fn ssh(host: impl Into<String>, user: Option<&str>, timeout: Duration) -> Self {
        let host = host.into();
        let destination = match user {
            Some(user) => format!("{}@{}", user, host),
            None => host,
        };
        Self {
            endpoint: destination.clone(),
            target: Target::Ssh { destination },
            timeout,
        }
    }

    /// Run commands on this machine.
    pub fn local(timeout: Duration) -> Self {
        Self {
            target: Target::Local,
            endpoint: "localhost".to_string(),
            timeout,
        }
    }

    fn command_for(&self, command_line: &str) -> Command {
        match &self.target {
            Target::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command_line);
                cmd
            }
            Target::Ssh { destination } => {
                let connect_timeout = self.timeout.as_secs().max(1);
                let mut cmd = Command::new("ssh");
                cmd.arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-o")
                    .arg(format!("ConnectTimeout={}", connect_timeout))
                    .arg(destination)
                    .arg(command_line);
                cmd
            }
        }
    }

    /// Execute `command_line` and collect its exit status and output.
    pub async fn execute(&self, command_line: &str) -> Result<ShellOutput, TransportError> {
        debug!(endpoint = %self.endpoint, command = command_line, "Executing");
        let mut cmd = self.command_for(command_line);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| TransportError::from_io(&self.endpoint, &e))?;

        let result = ShellOutput {
            // Killed by a signal: report like a shell would.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if matches!(self.target, Target::Ssh { .. }) && result.exit_code == SSH_FAILURE_STATUS {
            return Err(classify_ssh_failure(&self.endpoint, &result.stderr));
        }
        Ok(result)
    }
}

fn classify_ssh_failure(endpoint: &str, stderr: &str) -> TransportError {
    let endpoint = endpoint.to_string();
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission denied") || lower.contains("host key verification failed") {
        TransportError::Authentication { endpoint, message }
    } else if lower.contains("connection refused") {
        TransportError::ConnectionRefused { endpoint }
    } else if lower.contains("timed out") {
        TransportError::Timeout {
            endpoint,
            timeout: Duration::ZERO,
        }
    } else if lower.contains("connection reset") || lower.contains("connection closed") {
        TransportError::ConnectionReset { endpoint }
    } else {
        TransportError::Io { endpoint, message }
    }
}

#[async_trait]
impl Transport for RemoteShellTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RemoteShell
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Runs `command`, with a string `payload` appended as arguments.
    async fn send(&self, command: &str, payload: &Value) -> Result<Value, TransportError> {
        let command_line = match payload {
            Value::String(args) if !args.is_empty() => format!("{} {}", command, args),
            _ => command.to_string(),
        };
        let output = self.execute(&command_line).await?;
        serde_json::to_value(&output).map_err(|e| TransportError::MalformedResponse {
            endpoint: self.endpoint.clone(),
            message: e.to_string(),
        })
    }
}
