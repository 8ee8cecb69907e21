//! Local command execution using `tokio::process`

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::traits::CommandRunner;

/// Local command executor
///
/// Runs programs directly (no shell) on the local machine.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a new local executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip(self), level = "debug")]
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        let output = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ExecError::NotFound(program.to_string()),
                _ => ExecError::SpawnError(e.to_string()),
            })?;

        let duration = start.elapsed();
        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(program, status, duration = ?duration, "command completed");

        if !output.status.success() {
            warn!(program, status, stderr = %stderr.trim(), "command failed");
        }

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }
}

#[async_trait]
impl CommandRunner for LocalExecutor {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandResult, ExecError> {
        self.execute(program, args).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        match timeout(timeout_duration, self.execute(program, args)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    program,
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let executor = LocalExecutor::new();
        let result = executor.run("echo", &["hello"]).await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let executor = LocalExecutor::new();
        let result = executor.run("sh", &["-c", "exit 42"]).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.status, 42);
        assert!(matches!(
            result.into_stdout(),
            Err(ExecError::CommandFailed { status: 42, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let executor = LocalExecutor::new();
        let result = executor.run("sitrep-definitely-not-installed", &[]).await;

        assert!(matches!(result, Err(ExecError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let executor = LocalExecutor::new();
        let result = executor
            .run_with_timeout("sleep", &["5"], Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_run_with_stderr() {
        let executor = LocalExecutor::new();
        let result = executor.run("sh", &["-c", "echo error >&2"]).await.unwrap();

        assert!(result.success());
        assert_eq!(result.stderr.trim(), "error");
    }
}
