//! sitrep-core: the module execution engine
//!
//! Registries for modules and backends, the layered configuration system, the
//! dependency scheduler with its supervision hooks, payload assembly and the
//! run orchestrator that ties them together.

pub mod agent;
pub mod backend;
pub mod config;
pub mod error;
pub mod module;
pub mod payload;
pub mod perf;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod supervisor;

pub use agent::{Agent, RunSummary};
pub use backend::{Backend, BackendFailure, BackendSet};
pub use config::{ConfigKind, ConfigRegistry, ConfigValue, FromConfigValue, define_core_keys};
pub use error::{
    BackendError, ConfigError, ModuleError, RegistryError, RunError, SchedulerError,
};
pub use module::{
    Capabilities, Configurable, LogProducer, Module, ModuleContext, StorageDemander,
};
pub use registry::{
    BackendRegistry, BackendRegistryBuilder, ModuleRegistry, ModuleRegistryBuilder,
    PreparedModules,
};
pub use scheduler::{Plan, RunReport, Scheduler, SchedulerOptions};
pub use state::{ModuleState, SpanStatus};
pub use supervisor::{NoopSupervisor, Supervisor, SupervisorSpan, TracingSupervisor};
