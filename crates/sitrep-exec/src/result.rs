//! Result types for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success)
    pub status: i32,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout of a successful command
    ///
    /// # Errors
    /// Returns `CommandFailed` with the exit status and stderr otherwise.
    pub fn into_stdout(self) -> Result<String, ExecError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(ExecError::CommandFailed {
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}
