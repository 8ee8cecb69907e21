//! Error types for sitrep-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during command execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Program is not installed
    #[error("program not found: {0}")]
    NotFound(String),

    /// Command exited unsuccessfully
    #[error("command execution failed: {status} - {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

/// Aggregate of the per-item failures of one worker pool run
#[derive(Error, Debug, Clone, Default, PartialEq, Eq)]
#[error("{} of {} items failed, cancelled: {}", .failures.len(), .processed, .cancelled)]
pub struct PoolError {
    /// One message per failed item, in completion order
    pub failures: Vec<String>,
    /// Items handed to workers before the pool stopped
    pub processed: usize,
    /// Whether the pool stopped early because of cancellation
    pub cancelled: bool,
}
