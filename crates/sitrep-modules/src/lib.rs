//! sitrep-modules: built-in collectors
//!
//! Each collector is a [`sitrep_core::Module`] writing what it finds into the
//! shared inventory store. System state is read through [`platform::HostFs`]
//! and external tools are invoked through a [`sitrep_exec::CommandRunner`].

pub mod docker;
pub mod error;
pub mod host;
pub mod netstat;
pub mod network;
pub mod packages;
pub mod ping;
pub mod platform;
pub mod protocol;
pub mod scan;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use sitrep_core::{ModuleRegistryBuilder, RegistryError};
use sitrep_exec::CommandRunner;

pub use docker::Docker;
pub use error::CollectorError;
pub use host::{Chassis, HostBasic, HostCpu, HostDisk, HostGpu};
pub use netstat::Netstat;
pub use network::{Arp, HostNetwork};
pub use packages::{Dpkg, Rpm};
pub use ping::Ping;
pub use platform::HostFs;
pub use protocol::StandardProtocol;
pub use scan::TcpScan;

/// Register every built-in collector reading the running system
///
/// # Errors
/// Returns `Duplicate` if a collector of the same name is already registered.
pub fn register_builtin(
    builder: &mut ModuleRegistryBuilder,
    runner: Arc<dyn CommandRunner>,
) -> Result<(), RegistryError> {
    register_builtin_with(builder, runner, &HostFs::system())
}

/// Register every built-in collector against an explicit system tree
///
/// # Errors
/// Returns `Duplicate` if a collector of the same name is already registered.
pub fn register_builtin_with(
    builder: &mut ModuleRegistryBuilder,
    runner: Arc<dyn CommandRunner>,
    fs: &HostFs,
) -> Result<(), RegistryError> {
    builder
        .register(Box::new(HostBasic::new(fs.clone())))?
        .register(Box::new(HostCpu))?
        .register(Box::new(HostDisk::new(fs.clone())))?
        .register(Box::new(HostGpu::new(fs.clone())))?
        .register(Box::new(Chassis::new(Arc::clone(&runner), fs.clone())))?
        .register(Box::new(HostNetwork::new(Arc::clone(&runner))))?
        .register(Box::new(Ping::new(Arc::clone(&runner))))?
        .register(Box::new(Arp::new(fs.clone())))?
        .register(Box::new(Netstat::new(fs.clone())))?
        .register(Box::new(Dpkg::new(fs.clone())))?
        .register(Box::new(Rpm::new(Arc::clone(&runner))))?
        .register(Box::new(Docker::new(runner)))?
        .register(Box::new(TcpScan::new()))?
        .register(Box::new(StandardProtocol))?;
    Ok(())
}
