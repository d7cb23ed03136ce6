//! External mitigation hook.
//!
//! When the detector flags a source it may hand the address to a
//! [`Mitigation`] (for example a firewall rule). The hook is fire-and-forget:
//! the ingestion loop never waits on it and its failures are only logged.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::MitigationConfig;

/// Placeholder replaced with the flagged source address in command arguments.
pub const SOURCE_PLACEHOLDER: &str = "{ip}";

#[derive(Debug, Error)]
pub enum MitigationError {
    #[error("mitigation is enabled but no command is configured")]
    EmptyCommand,

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("'{command}' did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

#[async_trait]
pub trait Mitigation: Send + Sync {
    fn name(&self) -> &str;

    async fn mitigate(&self, source: &str) -> Result<(), MitigationError>;
}

/// Runs a configured command with the source address substituted.
pub struct CommandMitigation {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandMitigation {
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, MitigationError> {
        let (program, args) = command.split_first().ok_or(MitigationError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    /// `None` when mitigation is disabled.
    pub fn from_config(config: &MitigationConfig) -> Result<Option<Self>, MitigationError> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(&config.command, Duration::from_secs(config.timeout_sec)).map(Some)
    }

    fn args_for(&self, source: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(SOURCE_PLACEHOLDER, source))
            .collect()
    }
}

#[async_trait]
impl Mitigation for CommandMitigation {
    fn name(&self) -> &str {
        &self.program
    }

    async fn mitigate(&self, source: &str) -> Result<(), MitigationError> {
        let args = self.args_for(source);
        let command = format!("{} {}", self.program, args.join(" "));

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(MitigationError::Spawn { command, source: e }),
            Err(_) => {
                return Err(MitigationError::Timeout {
                    command,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(MitigationError::Failed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(ip = %source, command = %command, "mitigation applied");
        Ok(())
    }
}
