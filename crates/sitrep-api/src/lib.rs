//! sitrep-api: inventory and payload types
//!
//! Contains the entities collector modules write into the inventory store and
//! the payload handed to output backends.

pub mod error;
pub mod inventory;
pub mod payload;

pub use error::ParseError;
pub use inventory::{
    Application, ApplicationEndpoint, Cpu, Disk, EndpointPolicy, Gpu, InterfaceFlags, Machine,
    Merge, NetworkInterface, NetworkInterfaceSubnet, Package, PolicyAction, Protocol, Subnetwork,
};
pub use payload::{
    EndpointReport, ExtraInfo, MachineReport, ModuleErrorEntry, NicReport, Payload, PerfStats,
};
