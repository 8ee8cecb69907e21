//! Listening sockets of the host and the processes behind them

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use sitrep_api::{Application, ApplicationEndpoint, InterfaceFlags, Machine, NetworkInterface};
use sitrep_core::{Module, ModuleContext, ModuleError};
use sitrep_store::{InventoryStore, InventoryStoreExt};
use tracing::{debug, info, trace};

use crate::error::{CollectorError, Result};
use crate::host::require_host;
use crate::network::HOST_NETWORK;
use crate::platform::{HostFs, SocketEntry};

pub const NETSTAT: &str = "netstat";

/// Forwarders that merely relay container ports
const IGNORED_PROGRAMS: [&str; 1] = ["docker-proxy"];

/// Process information resolved once per pid
#[derive(Debug, Clone)]
struct Owner {
    pid: u32,
    args: Vec<String>,
    user: String,
}

impl Owner {
    fn program(&self) -> &str {
        self.args.first().map_or("", String::as_str)
    }

    fn basename(&self) -> &str {
        let program = self.program();
        program.rsplit('/').next().unwrap_or(program)
    }
}

/// Applications and endpoints from the kernel socket tables
pub struct Netstat {
    fs: HostFs,
}

impl Netstat {
    #[must_use]
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }

    async fn owner(&self, pid: u32, cache: &mut HashMap<u32, Option<Owner>>) -> Option<Owner> {
        if let Some(owner) = cache.get(&pid) {
            return owner.clone();
        }
        let owner = match self.fs.process_cmdline(pid).await {
            Ok(args) if !args.is_empty() => {
                let user = self
                    .fs
                    .process_user(pid)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                Some(Owner { pid, args, user })
            }
            Ok(_) => None,
            Err(e) => {
                trace!(pid, error = %e, "process vanished");
                None
            }
        };
        cache.insert(pid, owner.clone());
        owner
    }

    async fn collect(&self, ctx: &ModuleContext) -> Result<()> {
        let store = ctx.store.as_ref();
        let host = require_host(store).await?;
        let sockets = self.fs.listening_sockets().await?;
        let owners = self.fs.socket_owners().await?;

        let mut cache = HashMap::new();
        let mut endpoints = 0usize;
        for socket in &sockets {
            if ctx.cancel.is_cancelled() {
                return Err(CollectorError::Cancelled(NETSTAT.to_string()));
            }
            let owner = match owners.get(&socket.inode) {
                Some(pid) => self.owner(*pid, &mut cache).await,
                None => None,
            };
            if let Some(owner) = &owner
                && IGNORED_PROGRAMS.contains(&owner.basename())
            {
                trace!(port = socket.port, program = owner.program(), "skipping relay");
                continue;
            }

            let application_id = match &owner {
                Some(owner) => record_application(store, &host, owner).await?.id,
                None => 0,
            };
            endpoints += record_endpoints(store, &host, socket, application_id).await?;
        }

        info!(
            sockets = sockets.len(),
            endpoints,
            applications = cache.values().flatten().count(),
            "listeners recorded"
        );
        Ok(())
    }
}

async fn record_application(
    store: &dyn InventoryStore,
    host: &Machine,
    owner: &Owner,
) -> Result<Application> {
    let application = store
        .put(Application {
            machine_id: host.id,
            name: owner.program().to_string(),
            args: owner.args[1..].to_vec(),
            pid: Some(owner.pid),
            user: owner.user.clone(),
            ..Application::default()
        })
        .await?;
    Ok(application)
}

/// Bind the socket to every interface it is reachable on
async fn record_endpoints(
    store: &dyn InventoryStore,
    host: &Machine,
    socket: &SocketEntry,
    application_id: i64,
) -> Result<usize> {
    let bindings: Vec<(i64, IpAddr)> = if socket.local.is_loopback() {
        let lo = loopback_nic(store, host, socket.local).await?;
        vec![(lo.id, socket.local)]
    } else {
        let nics = store.nics_of(host.id).await?;
        if socket.local.is_unspecified() {
            nics.iter()
                .flat_map(|nic| {
                    nic.ips
                        .iter()
                        .filter(|ip| reachable_through_wildcard(socket.local, **ip))
                        .map(|ip| (nic.id, *ip))
                })
                .collect()
        } else {
            nics.iter()
                .filter(|nic| nic.has_ip(&socket.local))
                .map(|nic| (nic.id, socket.local))
                .collect()
        }
    };
    if bindings.is_empty() {
        debug!(addr = %socket.local, port = socket.port, "no interface holds the address");
    }

    for (nic_id, addr) in &bindings {
        store
            .put(ApplicationEndpoint {
                application_id,
                nic_id: *nic_id,
                addr: *addr,
                port: socket.port,
                protocol: socket.protocol,
                ..ApplicationEndpoint::default()
            })
            .await?;
    }
    Ok(bindings.len())
}

/// A v6 wildcard also accepts v4 traffic unless the socket is v6-only
fn reachable_through_wildcard(wildcard: IpAddr, ip: IpAddr) -> bool {
    match wildcard {
        IpAddr::V4(_) => ip.is_ipv4(),
        IpAddr::V6(_) => true,
    }
}

async fn loopback_nic(
    store: &dyn InventoryStore,
    host: &Machine,
    addr: IpAddr,
) -> Result<NetworkInterface> {
    let ips = match addr {
        IpAddr::V4(_) => vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        IpAddr::V6(_) => vec![IpAddr::V6(Ipv6Addr::LOCALHOST)],
    };
    let nic = store
        .put(NetworkInterface {
            machine_id: host.id,
            name: "lo".to_string(),
            ips: if ips.contains(&addr) { ips } else { vec![addr] },
            mask_size: if addr.is_ipv4() { 8 } else { 128 },
            flags: InterfaceFlags {
                up: true,
                loopback: true,
                running: true,
                ..InterfaceFlags::default()
            },
            ..NetworkInterface::default()
        })
        .await?;
    Ok(nic)
}

#[async_trait]
impl Module for Netstat {
    fn name(&self) -> &'static str {
        NETSTAT
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_NETWORK]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx).await?)
    }
}
