//! Collectors describing the host machine itself

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sitrep_api::{Cpu, Disk, Gpu, Machine};
use sitrep_core::{Module, ModuleContext, ModuleError};
use sitrep_exec::CommandRunner;
use sitrep_store::{InventoryStore, InventoryStoreExt};
use sysinfo::System;
use tokio::task;
use tracing::{debug, info};

use crate::error::{CollectorError, Result};
use crate::platform::{HostFs, OsRelease};

pub const HOST_BASIC: &str = "host-basic";
pub const HOST_CPU: &str = "host-cpu";
pub const HOST_DISK: &str = "host-disk";
pub const HOST_GPU: &str = "host-gpu";
pub const CHASSIS: &str = "chassis";

const HOSTNAMECTL_TIMEOUT: Duration = Duration::from_secs(5);

/// The host machine, failing when `host-basic` has not stored it
pub(crate) async fn require_host(store: &dyn InventoryStore) -> Result<Machine> {
    store.get_host().await?.ok_or(CollectorError::NoHost)
}

struct HostFacts {
    hostname: String,
    distribution: String,
    version: String,
    uptime: u64,
}

fn host_facts() -> HostFacts {
    HostFacts {
        hostname: System::host_name().unwrap_or_default(),
        distribution: System::distribution_id(),
        version: System::os_version().unwrap_or_default(),
        uptime: System::uptime(),
    }
}

/// Hostname, identity, OS and uptime of the host
pub struct HostBasic {
    fs: HostFs,
}

impl HostBasic {
    #[must_use]
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }

    async fn collect(&self, store: &dyn InventoryStore) -> Result<()> {
        let facts = task::spawn_blocking(host_facts).await?;
        let host_id = match self.fs.host_id().await {
            Ok(id) => id.unwrap_or_default(),
            Err(CollectorError::Unsupported(what)) => {
                debug!(%what, "no host id source");
                String::new()
            }
            Err(e) => return Err(e),
        };

        let release = match self.fs.os_release().await {
            Ok(release) => release.unwrap_or_default(),
            Err(CollectorError::Unsupported(what)) => {
                debug!(%what, "no os-release");
                OsRelease::default()
            }
            Err(e) => return Err(e),
        };
        let pick = |preferred: String, fallback: String| {
            if preferred.is_empty() { fallback } else { preferred }
        };

        let host = store.ensure_host().await?;
        let host = store
            .put(Machine {
                id: host.id,
                agent: Some(store.agent()),
                hostname: facts.hostname,
                host_id,
                arch: std::env::consts::ARCH.to_string(),
                platform: std::env::consts::OS.to_string(),
                distribution: pick(release.id, facts.distribution),
                distribution_version: pick(release.version_id, facts.version),
                distribution_like: release.id_like,
                uptime: Some(facts.uptime),
                ..Machine::default()
            })
            .await?;

        info!(
            hostname = %host.hostname,
            distribution = %host.distribution,
            like = %host.distribution_like,
            "host identified"
        );
        Ok(())
    }
}

#[async_trait]
impl Module for HostBasic {
    fn name(&self) -> &'static str {
        HOST_BASIC
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx.store.as_ref()).await?)
    }
}

/// Processor packages of the host, one row per model
#[derive(Default)]
pub struct HostCpu;

/// `(brand, vendor)` -> logical cores
fn cpu_facts() -> BTreeMap<(String, String), u32> {
    let system = System::new_all();
    let mut models = BTreeMap::new();
    for cpu in system.cpus() {
        *models
            .entry((cpu.brand().trim().to_string(), cpu.vendor_id().to_string()))
            .or_insert(0) += 1;
    }
    models
}

impl HostCpu {
    async fn collect(&self, store: &dyn InventoryStore) -> Result<()> {
        let host = require_host(store).await?;
        let models = task::spawn_blocking(cpu_facts).await?;
        for ((model_name, vendor), cores) in models {
            debug!(%model_name, cores, "cpu");
            store
                .put(Cpu {
                    machine_id: host.id,
                    model_name,
                    vendor,
                    cores,
                    ..Cpu::default()
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Module for HostCpu {
    fn name(&self) -> &'static str {
        HOST_CPU
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_BASIC]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx.store.as_ref()).await?)
    }
}

/// Physical block devices
pub struct HostDisk {
    fs: HostFs,
}

impl HostDisk {
    #[must_use]
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }

    async fn collect(&self, store: &dyn InventoryStore) -> Result<()> {
        let host = require_host(store).await?;
        for device in self.fs.block_devices().await? {
            store
                .put(Disk {
                    machine_id: host.id,
                    name: device.name,
                    model: device.model,
                    size: device.size,
                    kind: if device.rotational { "hdd" } else { "ssd" }.to_string(),
                    ..Disk::default()
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Module for HostDisk {
    fn name(&self) -> &'static str {
        HOST_DISK
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_BASIC]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx.store.as_ref()).await?)
    }
}

/// Display controllers on the PCI bus
pub struct HostGpu {
    fs: HostFs,
}

impl HostGpu {
    #[must_use]
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }

    async fn collect(&self, store: &dyn InventoryStore) -> Result<()> {
        let host = require_host(store).await?;
        for (index, device) in (0u32..).zip(self.fs.display_devices().await?) {
            debug!(slot = %device.slot, vendor = %device.vendor, "gpu");
            store
                .put(Gpu {
                    machine_id: host.id,
                    index,
                    vendor: device.vendor,
                    product: device.product,
                    driver: device.driver,
                    ..Gpu::default()
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Module for HostGpu {
    fn name(&self) -> &'static str {
        HOST_GPU
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_BASIC]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx.store.as_ref()).await?)
    }
}

/// Chassis kind, from systemd-hostnamed or the SMBIOS tables
pub struct Chassis {
    runner: Arc<dyn CommandRunner>,
    fs: HostFs,
}

impl Chassis {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, fs: HostFs) -> Self {
        Self { runner, fs }
    }

    async fn hostnamed(&self) -> Option<String> {
        let result = self
            .runner
            .run_with_timeout("hostnamectl", &["chassis"], HOSTNAMECTL_TIMEOUT)
            .await;
        match result.and_then(|r| r.into_stdout()) {
            Ok(out) => Some(out.trim().to_string()).filter(|c| !c.is_empty()),
            Err(e) => {
                debug!(error = %e, "hostnamectl unavailable");
                None
            }
        }
    }

    async fn collect(&self, store: &dyn InventoryStore) -> Result<()> {
        let host = require_host(store).await?;
        let chassis = match self.hostnamed().await {
            Some(chassis) => chassis,
            None => self
                .fs
                .chassis()
                .await?
                .ok_or_else(|| CollectorError::NotApplicable("chassis type not exposed".into()))?,
        };
        store
            .put(Machine {
                id: host.id,
                chassis,
                ..Machine::default()
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Module for Chassis {
    fn name(&self) -> &'static str {
        CHASSIS
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_BASIC]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx.store.as_ref()).await?)
    }
}
