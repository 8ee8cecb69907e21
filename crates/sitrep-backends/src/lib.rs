//! sitrep-backends: payload sinks
//!
//! Every backend is registered but disabled; `enable-backend-<name>` turns
//! one on for a run.

pub mod file;
pub mod format;
pub mod http;
pub mod stdout;

use sitrep_core::{BackendRegistryBuilder, RegistryError};

pub use file::FileBackend;
pub use format::Format;
pub use http::HttpBackend;
pub use stdout::StdoutBackend;

/// Register the stdout, file and http backends
///
/// # Errors
/// Returns `Duplicate` if a backend of the same name is already registered.
pub fn register_builtin(builder: &mut BackendRegistryBuilder) -> Result<(), RegistryError> {
    builder
        .register(Box::new(StdoutBackend::new()))?
        .register(Box::new(FileBackend::default()))?
        .register(Box::new(HttpBackend::default()))?;
    Ok(())
}
