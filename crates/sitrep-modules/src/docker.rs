//! Containers of the local Docker engine
//!
//! Containers become machines whose parent is the host. Published ports are
//! recorded as a host endpoint forwarding to the container endpoint.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sitrep_api::{
    ApplicationEndpoint, EndpointPolicy, InterfaceFlags, Machine, NetworkInterface,
    NetworkInterfaceSubnet, PolicyAction, Protocol, Subnetwork,
};
use sitrep_core::{Module, ModuleContext, ModuleError};
use sitrep_exec::{CommandRunner, ExecError};
use sitrep_store::{InventoryStore, InventoryStoreExt};
use tracing::{debug, info, warn};

use crate::error::{CollectorError, Result};
use crate::host::require_host;
use crate::network::HOST_NETWORK;

pub const DOCKER: &str = "docker";

const DOCKER_TIMEOUT: Duration = Duration::from_secs(30);
const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.id";

/// One element of `docker inspect`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    /// `"80/tcp"` -> host bindings (null when not published)
    #[serde(default)]
    pub ports: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
    #[serde(default)]
    pub networks: Option<BTreeMap<String, ContainerNetwork>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerNetwork {
    #[serde(rename = "NetworkID", default)]
    pub network_id: String,
    #[serde(rename = "Gateway", default)]
    pub gateway: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "IPPrefixLen", default)]
    pub ip_prefix_len: u8,
    #[serde(rename = "GlobalIPv6Address", default)]
    pub global_ipv6_address: String,
    #[serde(rename = "GlobalIPv6PrefixLen", default)]
    pub global_ipv6_prefix_len: u8,
    #[serde(rename = "MacAddress", default)]
    pub mac_address: String,
}

impl ContainerInspect {
    fn is_swarm_task(&self) -> bool {
        self.config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SWARM_SERVICE_LABEL))
            .is_some_and(|id| !id.is_empty())
    }

    fn uptime(&self) -> Option<u64> {
        let created = DateTime::parse_from_rfc3339(&self.created).ok()?;
        let elapsed = Utc::now().signed_duration_since(created.with_timezone(&Utc));
        u64::try_from(elapsed.num_seconds()).ok()
    }
}

/// Parse the JSON output of `docker inspect`
///
/// # Errors
/// Returns `Parse` if the output is not the expected JSON.
pub fn parse_inspect(json: &str) -> Result<Vec<ContainerInspect>> {
    serde_json::from_str(json).map_err(|e| CollectorError::Parse(format!("docker inspect: {e}")))
}

/// `nginx:1.25@sha256:...` -> (`nginx`, `1.25`); the tag defaults to `latest`
#[must_use]
pub fn split_image(image: &str) -> (String, String) {
    let image = image.split('@').next().unwrap_or(image);
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

/// `"8080/tcp"` -> (8080, tcp)
fn parse_port_key(key: &str) -> Option<(u16, Protocol)> {
    let (port, protocol) = key.split_once('/').unwrap_or((key, "tcp"));
    let protocol = match protocol {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        _ => return None,
    };
    Some((port.parse().ok()?, protocol))
}

/// Host address a published port is bound to on `nic`
fn bound_addr(nic: &NetworkInterface, host_ip: &str) -> Option<IpAddr> {
    nic.ips.iter().copied().find(|addr| match host_ip {
        "" | "0.0.0.0" => addr.is_ipv4(),
        "::" => addr.is_ipv6(),
        exact => exact.parse::<IpAddr>().is_ok_and(|ip| ip == *addr),
    })
}

/// Containers, their networks and their published ports
pub struct Docker {
    runner: Arc<dyn CommandRunner>,
}

impl Docker {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        match self.runner.run_with_timeout("docker", args, DOCKER_TIMEOUT).await {
            Ok(output) => Ok(output.into_stdout()?),
            Err(ExecError::NotFound(program)) => {
                Err(CollectorError::Unsupported(format!("{program} command")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn collect(&self, ctx: &ModuleContext) -> Result<()> {
        let store = ctx.store.as_ref();
        let host = require_host(store).await?;
        let host_nics = store.nics_of(host.id).await?;

        let listing = self.docker(&["ps", "-q", "--no-trunc"]).await?;
        let ids: Vec<&str> = listing.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            info!("no running container");
            return Ok(());
        }
        let mut args = vec!["inspect"];
        args.extend(&ids);
        let containers = parse_inspect(&self.docker(&args).await?)?;

        let mut recorded = 0usize;
        for container in &containers {
            if ctx.cancel.is_cancelled() {
                return Err(CollectorError::Cancelled(DOCKER.to_string()));
            }
            if container.is_swarm_task() {
                debug!(id = %container.id, "swarm task, skipping");
                continue;
            }
            match record_container(store, &host, &host_nics, container).await {
                Ok(()) => recorded += 1,
                Err(e) => warn!(id = %container.id, error = %e, "container not recorded"),
            }
        }
        info!(containers = recorded, "docker containers recorded");
        Ok(())
    }
}

async fn record_container(
    store: &dyn InventoryStore,
    host: &Machine,
    host_nics: &[NetworkInterface],
    container: &ContainerInspect,
) -> Result<()> {
    let (image, version) = split_image(&container.config.image);
    let machine = store
        .put(Machine {
            hostname: container.name.trim_start_matches('/').to_string(),
            host_id: container.id.clone(),
            platform: DOCKER.to_string(),
            distribution: image,
            distribution_version: version,
            chassis: "container".to_string(),
            uptime: container.uptime(),
            parent_machine_id: host.id,
            ..Machine::default()
        })
        .await?;

    let networks = container.network_settings.networks.iter().flatten();
    let mut primary: Option<NetworkInterface> = None;
    for (name, network) in networks {
        let Some(nic) = record_network(store, machine.id, name, network).await? else {
            continue;
        };
        if primary.is_none() && nic.ips.iter().any(IpAddr::is_ipv4) {
            primary = Some(nic);
        }
    }

    let Some(primary) = primary else {
        debug!(container = %machine.hostname, "no addressed network, ports not recorded");
        return Ok(());
    };
    let Some(container_addr) = primary.ips.iter().copied().find(IpAddr::is_ipv4) else {
        return Ok(());
    };

    let ports = container.network_settings.ports.iter().flatten();
    for (key, bindings) in ports {
        let Some((port, protocol)) = parse_port_key(key) else {
            debug!(%key, "unrecognized port");
            continue;
        };
        let endpoint = store
            .put(ApplicationEndpoint {
                nic_id: primary.id,
                addr: container_addr,
                port,
                protocol,
                ..ApplicationEndpoint::default()
            })
            .await?;

        for binding in bindings.iter().flatten() {
            let Ok(public) = binding.host_port.parse::<u16>() else {
                continue;
            };
            for nic in host_nics {
                let Some(addr) = bound_addr(nic, &binding.host_ip) else {
                    continue;
                };
                let published = store
                    .put(ApplicationEndpoint {
                        nic_id: nic.id,
                        addr,
                        port: public,
                        protocol,
                        ..ApplicationEndpoint::default()
                    })
                    .await?;
                store
                    .put(EndpointPolicy {
                        endpoint_id: endpoint.id,
                        action: PolicyAction::Forward,
                        src_endpoint_id: published.id,
                        source: DOCKER.to_string(),
                        ..EndpointPolicy::default()
                    })
                    .await?;
                debug!(%addr, public, port, container = %machine.hostname, "port forward");
            }
        }
    }
    Ok(())
}

async fn record_network(
    store: &dyn InventoryStore,
    machine_id: i64,
    name: &str,
    network: &ContainerNetwork,
) -> Result<Option<NetworkInterface>> {
    let v4 = network.ip_address.parse::<IpAddr>().ok();
    let v6 = network.global_ipv6_address.parse::<IpAddr>().ok();
    let mac = network.mac_address.to_ascii_lowercase();
    if v4.is_none() && v6.is_none() && mac.is_empty() {
        return Ok(None);
    }

    let nic = store
        .put(NetworkInterface {
            machine_id,
            name: name.to_string(),
            mac: mac.clone(),
            ips: v4.into_iter().chain(v6).collect(),
            gateway: network.gateway.parse().ok(),
            mask_size: network.ip_prefix_len,
            flags: InterfaceFlags {
                up: true,
                running: true,
                ..InterfaceFlags::default()
            },
            tag: network.network_id.clone(),
            ..NetworkInterface::default()
        })
        .await?;

    let prefixes = [
        (v4, network.ip_prefix_len),
        (v6, network.global_ipv6_prefix_len),
    ];
    for (ip, prefix) in prefixes {
        let Some(ip) = ip.filter(|_| prefix > 0) else {
            continue;
        };
        let mut subnet = Subnetwork::from_prefix(ip, prefix);
        subnet.tag = network.network_id.clone();
        subnet.gateway = nic.gateway.filter(|gw| subnet.contains(gw));
        let subnet = store.put(subnet).await?;
        store
            .put(NetworkInterfaceSubnet {
                nic_id: nic.id,
                subnet_id: subnet.id,
                ip: Some(ip),
                mac_subnet: NetworkInterfaceSubnet::derive_key(&mac, &subnet.cidr),
                ..NetworkInterfaceSubnet::default()
            })
            .await?;
    }
    Ok(Some(nic))
}

#[async_trait]
impl Module for Docker {
    fn name(&self) -> &'static str {
        DOCKER
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_NETWORK]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx).await?)
    }
}
