//! sitrep-exec: local execution helpers for collectors
//!
//! Provides command execution via `tokio::process` and a bounded worker pool
//! for per-item network checks.

pub mod error;
pub mod local;
pub mod pool;
pub mod result;
pub mod traits;

pub use error::{ExecError, PoolError};
pub use local::LocalExecutor;
pub use pool::WorkerPool;
pub use result::CommandResult;
pub use traits::CommandRunner;
