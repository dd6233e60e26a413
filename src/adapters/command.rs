//! Shell command adapter.
//!
//! Runs a stage command through a shell, writes the task's JSON input to
//! its stdin and collects stdout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{Adapter, AdapterOutput};

/// Adapter that runs commands with `sh -c`
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    /// Shell used to interpret commands (default: "sh")
    shell: String,
}

impl Default for CommandAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandAdapter {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell binary
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    async fn execute_subprocess(&self, command: &str, input: &str, limit: Duration) -> Result<AdapterOutput> {
        let started = Instant::now();
        let mut process = Command::new(&self.shell);
        process
            .args(["-c", command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process
            .spawn()
            .with_context(|| format!("Failed to spawn command '{}'", command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .with_context(|| format!("Failed to write to stdin of '{}'", command))?;
            // Drop stdin to signal EOF
        }

        let output = timeout(limit, child.wait_with_output())
            .await
            .with_context(|| format!("Command '{}' timed out after {:?}", command, limit))?
            .with_context(|| format!("Failed to wait for command '{}'", command))?;

        let diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Command '{}' failed with exit code {}: {}",
                command,
                exit_code,
                diagnostics.trim()
            );
        }

        let content = String::from_utf8(output.stdout)
            .with_context(|| format!("Output of '{}' is not valid UTF-8", command))?;
        debug!(command, elapsed_ms = started.elapsed().as_millis() as u64, "Command finished");

        Ok(AdapterOutput {
            content,
            diagnostics,
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl Adapter for CommandAdapter {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, action: &str, input: &str, timeout: Duration) -> Result<AdapterOutput> {
        self.execute_subprocess(action, input, timeout).await
    }

    async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.shell)
            .args(["-c", "true"])
            .output()
            .await
            .with_context(|| format!("Failed to start shell '{}'", self.shell))?;

        if !output.status.success() {
            anyhow::bail!("Shell '{}' is not usable", self.shell);
        }

        Ok(())
    }
}
