//! Error types for sitrep-modules

use std::path::PathBuf;

use sitrep_core::ModuleError;
use sitrep_exec::{ExecError, PoolError};
use sitrep_store::StoreError;
use thiserror::Error;

/// Result alias for collectors
pub type Result<T, E = CollectorError> = std::result::Result<T, E>;

/// Errors raised by collectors
#[derive(Error, Debug)]
pub enum CollectorError {
    /// The data source does not exist on this platform
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    /// The host is not the kind of system this collector targets
    #[error("not applicable: {0}")]
    NotApplicable(String),

    /// The host machine has not been collected yet
    #[error("cannot retrieve host machine")]
    NoHost,

    /// The run was cancelled mid-collection
    #[error("cancelled during {0}")]
    Cancelled(String),

    /// A system file could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output of a tool or system file was malformed
    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A blocking task panicked or was aborted
    #[error("collector task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CollectorError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CollectorError::Read {
            path: path.into(),
            source,
        }
    }
}

impl From<CollectorError> for ModuleError {
    fn from(err: CollectorError) -> Self {
        match err {
            CollectorError::Unsupported(what) | CollectorError::NotApplicable(what) => {
                ModuleError::Unsupported(what)
            }
            CollectorError::Cancelled(what) => ModuleError::Cancelled(what),
            CollectorError::Read { path, source } => {
                ModuleError::io(path.display().to_string(), source)
            }
            CollectorError::Exec(e) => ModuleError::Exec(e),
            CollectorError::Store(e) => ModuleError::Store(e),
            CollectorError::Pool(e) => ModuleError::Pool(e),
            other => ModuleError::msg(other.to_string()),
        }
    }
}
