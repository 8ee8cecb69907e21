//! Module contract and optional capabilities

use std::sync::Arc;

use async_trait::async_trait;
use sitrep_store::InventoryStore;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::config::ConfigRegistry;
use crate::error::{ConfigError, ModuleError};

/// Everything a module sees while it runs
#[derive(Clone)]
pub struct ModuleContext {
    /// Cancelled when the run is interrupted
    pub cancel: CancellationToken,
    pub store: Arc<dyn InventoryStore>,
    /// The `module` span this run is instrumented with
    pub span: Span,
}

impl ModuleContext {
    #[must_use]
    pub fn new(cancel: CancellationToken, store: Arc<dyn InventoryStore>, span: Span) -> Self {
        Self {
            cancel,
            store,
            span,
        }
    }

    /// Bail out with `ModuleError::Cancelled` once the run is cancelled
    ///
    /// # Errors
    /// Returns `ModuleError::Cancelled` if the token fired.
    pub fn check_cancelled(&self, what: &str) -> Result<(), ModuleError> {
        if self.cancel.is_cancelled() {
            return Err(ModuleError::Cancelled(what.to_string()));
        }
        Ok(())
    }
}

/// A named unit of data collection
///
/// Modules declare the names of the modules whose results they read and are
/// run after them. Failures are collected by the scheduler and never stop the
/// run.
#[async_trait]
pub trait Module: Send + Sync {
    /// Unique, stable name
    fn name(&self) -> &'static str;

    /// Names of modules that must run first
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Collect and write findings into `ctx.store`
    ///
    /// # Errors
    /// Any error is recorded against this module only.
    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError>;

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        None
    }

    fn as_log_producer(&mut self) -> Option<&mut dyn LogProducer> {
        None
    }

    fn as_storage_demander(&mut self) -> Option<&mut dyn StorageDemander> {
        None
    }
}

/// Component exposing configuration options
pub trait Configurable: Send + Sync {
    /// Declare options, conventionally `<name>.<option>`
    ///
    /// # Errors
    /// Returns `DuplicateKey` if an option collides with an existing key.
    fn bind(&self, config: &mut ConfigRegistry) -> Result<(), ConfigError>;

    /// Read resolved values before the run
    ///
    /// # Errors
    /// Returns a `ConfigError` for unreadable or invalid values.
    fn configure(&mut self, config: &ConfigRegistry) -> Result<(), ConfigError>;
}

/// Component that wants its own logging span
pub trait LogProducer: Send + Sync {
    fn set_logger(&mut self, span: Span);
}

/// Component that keeps a store handle beyond `run`
pub trait StorageDemander: Send + Sync {
    fn set_store(&mut self, store: Arc<dyn InventoryStore>);
}

/// Optional capabilities detected once at registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub configurable: bool,
    pub log_producer: bool,
    pub storage_demander: bool,
}

impl Capabilities {
    pub fn of_module(module: &mut dyn Module) -> Self {
        Self {
            configurable: module.as_configurable().is_some(),
            log_producer: module.as_log_producer().is_some(),
            storage_demander: module.as_storage_demander().is_some(),
        }
    }
}
