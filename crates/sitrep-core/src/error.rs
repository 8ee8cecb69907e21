//! Core error types for sitrep-core

use std::path::PathBuf;

use sitrep_exec::{ExecError, PoolError};
use sitrep_store::StoreError;
use thiserror::Error;

use crate::config::ConfigKind;
use crate::state::ModuleState;

/// Misconfiguration; always fatal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Key was never defined
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    /// Key defined twice
    #[error("configuration key defined twice: {0}")]
    DuplicateKey(String),

    /// Typed read does not match the declared kind
    #[error("configuration key {key} is {actual:?}, read as {expected:?}")]
    TypeMismatch {
        key: String,
        expected: ConfigKind,
        actual: ConfigKind,
    },

    /// Raw value cannot be parsed as the declared kind
    #[error("invalid value for {key} ({kind:?}): {value}")]
    InvalidValue {
        key: String,
        kind: ConfigKind,
        value: String,
    },

    /// Configuration file could not be read or parsed
    #[error("cannot load {path}: {message}")]
    File { path: PathBuf, message: String },
}

/// Registration problems detected while sealing a registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two modules (or backends) share a name
    #[error("{kind} registered twice: {name}")]
    Duplicate { kind: &'static str, name: String },

    /// A dependency names a module that was never registered
    #[error("module {module} depends on unregistered module {dependency}")]
    UnknownDependency { module: String, dependency: String },

    /// Binding configuration failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Run-level scheduler failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A dependency is unknown or disabled and missing dependencies are not ignored
    #[error("module {module} depends on missing module {missing}")]
    DependencyUnresolvable { module: String, missing: String },

    /// Dependencies form a cycle
    #[error("dependency cycle between modules: {}", .modules.join(", "))]
    DependencyCycle { modules: Vec<String> },

    /// A module returned an error; collected, never raised by the scheduler
    #[error("module {module} failed: {cause}")]
    ModuleFailed { module: String, cause: String },

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// Illegal module state change
    #[error("module {module} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        module: String,
        from: ModuleState,
        to: ModuleState,
    },
}

/// Error returned by a module's `run`
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("{0}")]
    Message(String),

    /// The module stopped because the run was cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("exec: {0}")]
    Exec(#[from] ExecError),

    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Not available on this platform
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ModuleError {
    /// Free-form failure
    pub fn msg(message: impl Into<String>) -> Self {
        ModuleError::Message(message.into())
    }

    /// Attach a context to an I/O error
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ModuleError::Io {
            context: context.into(),
            source,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModuleError::Cancelled(_))
    }
}

/// Error returned by a backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Remote side answered with a non-success status
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// `write` called before a successful `init`
    #[error("backend not initialized")]
    NotInitialized,
}

/// Fatal run-level errors
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registering or sealing modules and backends failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("inventory store: {0}")]
    Store(#[from] StoreError),

    /// An enabled backend failed `init`
    #[error("backend {backend} failed to initialize: {source}")]
    BackendInit {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Scheduler(SchedulerError),

    /// The run was cancelled; the payload was still delivered
    #[error("run cancelled")]
    Cancelled,
}

impl From<SchedulerError> for RunError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Cancelled => RunError::Cancelled,
            other => RunError::Scheduler(other),
        }
    }
}

impl RunError {
    /// Process exit code for this error
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) | RunError::Registry(_) => 2,
            RunError::BackendInit { .. } => 3,
            RunError::Scheduler(_) => 4,
            RunError::Store(_) => 5,
            RunError::Cancelled => 130,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_errors_are_usage_errors() {
        let duplicate = RunError::from(RegistryError::Duplicate {
            kind: "module",
            name: "netstat".to_string(),
        });
        assert_eq!(duplicate.exit_code(), 2);

        let binding = RunError::from(RegistryError::Config(ConfigError::DuplicateKey(
            "log-level".to_string(),
        )));
        assert_eq!(binding.exit_code(), 2);
        assert_eq!(RunError::Cancelled.exit_code(), 130);
    }
}
