//! Kill-directive execution
//!
//! Terminates the process behind the current activity label:
//! - Windows: `taskkill /F /IM <label>`
//! - Unix: `pkill -x <label>`
//! - Bounded by a timeout, failures are reported, never retried

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// Command execution result
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("refusing to terminate idle or empty label {0:?}")]
    InvalidLabel(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Process-control capability used when a kill directive arrives.
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    async fn terminate_by_label(&self, label: &str) -> Result<ExecutionResult, ExecutionError>;
}

/// Cross-platform command executor
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Program and arguments that kill every process named `label`.
    pub fn kill_command(label: &str) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "windows") {
            ("taskkill", vec!["/F".into(), "/IM".into(), label.to_string()])
        } else {
            ("pkill", vec!["-x".into(), label.to_string()])
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<ExecutionResult, ExecutionError> {
        let start_time = Instant::now();
        debug!(program, ?args, "running kill command");

        let output = tokio::time::timeout(
            self.timeout,
            AsyncCommand::new(program)
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ExecutionError::Timeout {
            program: program.to_string(),
            timeout: self.timeout,
        })?
        .map_err(|source| ExecutionError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined_output = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{}\nSTDERR:\n{}", stdout, stderr)
        };

        Ok(ExecutionResult {
            success: output.status.success(),
            output: combined_output,
            exit_code: output.status.code(),
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}

#[async_trait]
impl ProcessTerminator for CommandExecutor {
    async fn terminate_by_label(&self, label: &str) -> Result<ExecutionResult, ExecutionError> {
        let label = label.trim();
        if nexus_protocol::is_idle(label) {
            return Err(ExecutionError::InvalidLabel(label.to_string()));
        }

        info!(label, "terminating active process");
        let (program, args) = Self::kill_command(label);
        self.run(program, &args).await
    }
}
