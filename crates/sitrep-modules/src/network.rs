//! Network interfaces of the host and its layer-2 neighbours

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sitrep_api::{InterfaceFlags, Machine, NetworkInterface, NetworkInterfaceSubnet, Subnetwork};
use sitrep_core::{Module, ModuleContext, ModuleError};
use sitrep_exec::CommandRunner;
use sitrep_store::{InventoryStore, InventoryStoreExt, MachineLookup};
use tracing::{debug, info, warn};

use crate::error::{CollectorError, Result};
use crate::host::{HOST_BASIC, require_host};
use crate::ping::PING;
use crate::platform::{ArpEntry, HostFs};

pub const HOST_NETWORK: &str = "host-network";
pub const ARP: &str = "arp";

const IP_TIMEOUT: Duration = Duration::from_secs(10);

/// One interface of `ip -j addr show`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpLink {
    pub ifname: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpAddrInfo {
    pub local: IpAddr,
    pub prefixlen: u8,
}

/// One route of `ip -j route show default`
#[derive(Debug, Clone, Deserialize)]
pub struct IpRoute {
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub dev: String,
}

impl IpLink {
    /// Interfaces that do not lead anywhere off the host
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        let flags = self.interface_flags();
        flags.loopback
            || !flags.up
            || self.ifname.starts_with("veth")
            || self.ifname.contains("qemu")
    }

    #[must_use]
    pub fn interface_flags(&self) -> InterfaceFlags {
        InterfaceFlags::from_names(self.flags.iter().map(String::as_str))
    }

    #[must_use]
    pub fn mac(&self) -> String {
        self.address
            .as_deref()
            .filter(|a| *a != "00:00:00:00:00:00")
            .unwrap_or_default()
            .to_ascii_lowercase()
    }
}

/// Parse the JSON output of `ip -j addr show`
///
/// # Errors
/// Returns `Parse` if the output is not the expected JSON.
pub fn parse_links(json: &str) -> Result<Vec<IpLink>> {
    serde_json::from_str(json).map_err(|e| CollectorError::Parse(format!("ip addr: {e}")))
}

/// Parse the JSON output of `ip -j route show default`
///
/// # Errors
/// Returns `Parse` if the output is not the expected JSON.
pub fn parse_routes(json: &str) -> Result<Vec<IpRoute>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json).map_err(|e| CollectorError::Parse(format!("ip route: {e}")))
}

/// Interfaces, addresses, subnetworks and default gateways of the host
pub struct HostNetwork {
    runner: Arc<dyn CommandRunner>,
}

impl HostNetwork {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn ip(&self, args: &[&str]) -> Result<String> {
        Ok(self
            .runner
            .run_with_timeout("ip", args, IP_TIMEOUT)
            .await?
            .into_stdout()?)
    }

    async fn collect(&self, store: &dyn InventoryStore) -> Result<()> {
        let host = require_host(store).await?;
        let links = parse_links(&self.ip(&["-j", "addr", "show"]).await?)?;
        let routes = match self.ip(&["-j", "route", "show", "default"]).await {
            Ok(out) => parse_routes(&out)?,
            Err(e) => {
                warn!(error = %e, "default routes unavailable");
                Vec::new()
            }
        };

        let mut recorded = 0usize;
        for link in links.iter().filter(|l| !l.is_ignored()) {
            let gateway = routes
                .iter()
                .find(|r| r.dev == link.ifname)
                .and_then(|r| r.gateway);
            record_link(store, &host, link, gateway).await?;
            recorded += 1;
        }
        info!(interfaces = recorded, "host interfaces recorded");
        Ok(())
    }
}

async fn record_link(
    store: &dyn InventoryStore,
    host: &Machine,
    link: &IpLink,
    gateway: Option<IpAddr>,
) -> Result<()> {
    let mac = link.mac();
    let mask_size = link
        .addr_info
        .iter()
        .find(|a| a.local.is_ipv4())
        .or_else(|| link.addr_info.first())
        .map_or(0, |a| a.prefixlen);

    let nic = store
        .put(NetworkInterface {
            machine_id: host.id,
            name: link.ifname.clone(),
            mac: mac.clone(),
            ips: link.addr_info.iter().map(|a| a.local).collect(),
            gateway,
            mask_size,
            flags: link.interface_flags(),
            ..NetworkInterface::default()
        })
        .await?;
    debug!(nic = %nic.name, ips = nic.ips.len(), "interface");

    for addr in &link.addr_info {
        let mut subnet = Subnetwork::from_prefix(addr.local, addr.prefixlen);
        subnet.gateway = gateway.filter(|gw| subnet.contains(gw));
        let subnet = store.put(subnet).await?;
        store
            .put(NetworkInterfaceSubnet {
                nic_id: nic.id,
                subnet_id: subnet.id,
                ip: Some(addr.local),
                mac_subnet: NetworkInterfaceSubnet::derive_key(&mac, &subnet.cidr),
                ..NetworkInterfaceSubnet::default()
            })
            .await?;
    }
    Ok(())
}

#[async_trait]
impl Module for HostNetwork {
    fn name(&self) -> &'static str {
        HOST_NETWORK
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_BASIC]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx.store.as_ref()).await?)
    }
}

/// Neighbour machines from the kernel ARP table
pub struct Arp {
    fs: HostFs,
}

impl Arp {
    #[must_use]
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }

    async fn collect(&self, ctx: &ModuleContext) -> Result<()> {
        let store = ctx.store.as_ref();
        let host = require_host(store).await?;
        let host_nics = store.nics_of(host.id).await?;
        let subnets = store.subnetworks().await?;

        let entries = self.fs.arp_table().await?;
        let mut discovered = 0usize;
        for entry in &entries {
            if ctx.cancel.is_cancelled() {
                return Err(CollectorError::Cancelled(ARP.to_string()));
            }
            if host_nics.iter().any(|nic| nic.has_ip(&entry.ip)) {
                continue;
            }
            let mask_size = host_nics
                .iter()
                .find(|nic| nic.name == entry.device)
                .map_or(0, |nic| nic.mask_size);
            match record_neighbour(store, entry, mask_size, &subnets).await {
                Ok(true) => discovered += 1,
                Ok(false) => {}
                Err(e) => warn!(ip = %entry.ip, mac = %entry.mac, error = %e, "neighbour not recorded"),
            }
        }
        info!(entries = entries.len(), discovered, "arp table walked");
        Ok(())
    }
}

/// Merge one ARP entry into the inventory, returning whether a machine was created
async fn record_neighbour(
    store: &dyn InventoryStore,
    entry: &ArpEntry,
    mask_size: u8,
    subnets: &[Subnetwork],
) -> Result<bool> {
    if store
        .find_machine_by(MachineLookup::IpMac(entry.ip, entry.mac.clone()))
        .await?
        .is_some()
    {
        return Ok(false);
    }

    // Known by address: fill in the hardware address
    if let Some(machine) = store.find_machine_by(MachineLookup::Ip(entry.ip)).await? {
        if let Some(nic) = store
            .nics_of(machine.id)
            .await?
            .into_iter()
            .find(|nic| nic.has_ip(&entry.ip) && nic.mac.is_empty())
        {
            store
                .put(NetworkInterface {
                    id: nic.id,
                    machine_id: machine.id,
                    mac: entry.mac.clone(),
                    ..NetworkInterface::default()
                })
                .await?;
        }
        return Ok(false);
    }

    // Known by hardware address: add the IP
    if let Some(machine) = store.find_machine_by(MachineLookup::Mac(entry.mac.clone())).await? {
        if let Some(nic) = store
            .nics_of(machine.id)
            .await?
            .into_iter()
            .find(|nic| nic.mac.eq_ignore_ascii_case(&entry.mac))
        {
            store
                .put(NetworkInterface {
                    id: nic.id,
                    machine_id: machine.id,
                    ips: vec![entry.ip],
                    ..NetworkInterface::default()
                })
                .await?;
            link_subnet(store, nic.id, &entry.mac, entry.ip, subnets).await?;
        }
        return Ok(false);
    }

    let machine = store.put(Machine::default()).await?;
    let nic = store
        .put(NetworkInterface {
            machine_id: machine.id,
            mac: entry.mac.clone(),
            ips: vec![entry.ip],
            mask_size,
            ..NetworkInterface::default()
        })
        .await?;
    link_subnet(store, nic.id, &entry.mac, entry.ip, subnets).await?;
    debug!(machine = machine.id, ip = %entry.ip, "neighbour discovered");
    Ok(true)
}

async fn link_subnet(
    store: &dyn InventoryStore,
    nic_id: i64,
    mac: &str,
    ip: IpAddr,
    subnets: &[Subnetwork],
) -> Result<()> {
    let Some(subnet) = subnets.iter().find(|s| s.contains(&ip)) else {
        return Ok(());
    };
    store
        .put(NetworkInterfaceSubnet {
            nic_id,
            subnet_id: subnet.id,
            ip: Some(ip),
            mac_subnet: NetworkInterfaceSubnet::derive_key(mac, &subnet.cidr),
            ..NetworkInterfaceSubnet::default()
        })
        .await?;
    Ok(())
}

#[async_trait]
impl Module for Arp {
    fn name(&self) -> &'static str {
        ARP
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_NETWORK, PING]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        ctx.check_cancelled(ARP)?;
        Ok(self.collect(ctx).await?)
    }
}
