//! ICMP echo sweep of the local IPv4 networks
//!
//! Pinging every address refreshes the kernel neighbour table before `arp`
//! reads it and records hosts that answer but never talked to us.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sitrep_api::{InterfaceFlags, Machine, NetworkInterface, NetworkInterfaceSubnet, Subnetwork};
use sitrep_core::{
    ConfigError, ConfigRegistry, Configurable, LogProducer, Module, ModuleContext, ModuleError,
};
use sitrep_exec::{CommandRunner, ExecError, WorkerPool};
use sitrep_store::{InventoryStore, InventoryStoreExt, MachineLookup};
use tokio::sync::Mutex;
use tracing::{Instrument, Span, debug, info, trace, warn};

use crate::error::{CollectorError, Result};
use crate::host::require_host;
use crate::network::HOST_NETWORK;

pub const PING: &str = "ping";

const TIMEOUT_MS: &str = "ping.timeout-ms";
const WORKERS: &str = "ping.workers";

/// Networks wider than this are not swept
const WIDEST_PREFIX: u8 = 20;
/// Private networks narrower than this are swept as a /24
const SWEEP_PREFIX: u8 = 24;

/// Addresses to ping in `subnet`, `None` when the network is too wide
///
/// Narrow private networks (VPN point-to-point links) are widened to a /24.
/// The network and broadcast addresses are skipped when the range has more
/// than two addresses.
#[must_use]
pub fn sweep_targets(subnet: &Subnetwork) -> Option<Vec<Ipv4Addr>> {
    let base: Ipv4Addr = subnet
        .network_addr
        .parse()
        .ok()
        .or_else(|| subnet.cidr.split('/').next()?.parse().ok())?;
    let mut prefix = subnet.mask_size;
    if !(WIDEST_PREFIX..=32).contains(&prefix) {
        return None;
    }
    if prefix > SWEEP_PREFIX && (base.is_private() || base.is_link_local()) {
        prefix = SWEEP_PREFIX;
    }

    let mask = u32::MAX.checked_shl(u32::from(32 - prefix)).unwrap_or(0);
    let network = u32::from(base) & mask;
    let size = 1u32 << (32 - prefix);
    let range = if size <= 2 {
        network..network + size
    } else {
        network + 1..network + size - 1
    };
    Some(range.map(Ipv4Addr::from).collect())
}

/// Discovers live hosts on the local networks with one echo request each
pub struct Ping {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    workers: usize,
    span: Span,
}

impl Ping {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: Duration::from_millis(1000),
            workers: 64,
            span: Span::none(),
        }
    }

    /// Whether `ip` answered a single echo request
    async fn echo(&self, ip: Ipv4Addr) -> std::result::Result<bool, ExecError> {
        let wait = self.timeout.as_secs().max(1).to_string();
        let addr = ip.to_string();
        let result = self
            .runner
            .run_with_timeout(
                "ping",
                &["-n", "-c", "1", "-W", &wait, &addr],
                self.timeout + Duration::from_secs(1),
            )
            .await;
        match result {
            Ok(output) => Ok(output.success()),
            Err(ExecError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn sweep(&self, ctx: &ModuleContext, targets: Vec<Ipv4Addr>) -> Result<Vec<Ipv4Addr>> {
        let alive = Mutex::new(Vec::new());
        let pool = WorkerPool::new(self.workers, ctx.cancel.clone());
        let result = pool
            .run(targets, |ip| {
                let alive = &alive;
                async move {
                    if self.echo(ip).await? {
                        trace!(%ip, "echo reply");
                        alive.lock().await.push(ip);
                    }
                    Ok::<_, ExecError>(())
                }
            })
            .instrument(self.span.clone())
            .await;
        match result {
            Ok(_) => Ok(alive.into_inner()),
            Err(e) if e.cancelled => Err(CollectorError::Cancelled(PING.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn collect(&self, ctx: &ModuleContext) -> Result<()> {
        let store = ctx.store.as_ref();
        let host = require_host(store).await?;
        let own: Vec<IpAddr> = store
            .nics_of(host.id)
            .await?
            .into_iter()
            .flat_map(|nic| nic.ips)
            .collect();

        if let Err(ExecError::NotFound(program)) =
            self.runner.run_with_timeout("ping", &["-V"], self.timeout).await
        {
            return Err(CollectorError::Unsupported(format!("{program} command")));
        }

        let mut discovered = 0usize;
        for subnet in store.all_ipv4_networks().await? {
            let Some(targets) = sweep_targets(&subnet) else {
                warn!(network = %subnet.cidr, "network too wide, not pinging");
                continue;
            };
            let targets: Vec<Ipv4Addr> = targets
                .into_iter()
                .filter(|ip| !own.contains(&IpAddr::V4(*ip)))
                .collect();
            info!(network = %subnet.cidr, targets = targets.len(), "pinging network");

            for ip in self.sweep(ctx, targets).await? {
                if record_alive(store, &subnet, IpAddr::V4(ip)).await? {
                    discovered += 1;
                }
            }
        }
        info!(discovered, "ping sweep complete");
        Ok(())
    }
}

/// Store a machine for an answering address nobody owns yet
async fn record_alive(store: &dyn InventoryStore, subnet: &Subnetwork, ip: IpAddr) -> Result<bool> {
    if store.find_machine_by(MachineLookup::Ip(ip)).await?.is_some() {
        return Ok(false);
    }
    let machine = store.put(Machine::default()).await?;
    let nic = store
        .put(NetworkInterface {
            machine_id: machine.id,
            ips: vec![ip],
            mask_size: subnet.mask_size,
            flags: InterfaceFlags {
                up: true,
                running: true,
                ..InterfaceFlags::default()
            },
            ..NetworkInterface::default()
        })
        .await?;
    store
        .insert_or_keep(NetworkInterfaceSubnet {
            nic_id: nic.id,
            subnet_id: subnet.id,
            ip: Some(ip),
            ..NetworkInterfaceSubnet::default()
        })
        .await?;
    debug!(machine = machine.id, %ip, "host answered");
    Ok(true)
}

impl Configurable for Ping {
    fn bind(&self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.define(TIMEOUT_MS, 1000u64, "Echo reply timeout in milliseconds")?;
        config.define(WORKERS, 64u64, "Concurrent echo requests")?;
        Ok(())
    }

    fn configure(&mut self, config: &ConfigRegistry) -> Result<(), ConfigError> {
        self.timeout = Duration::from_millis(config.get(TIMEOUT_MS)?);
        self.workers = config.get(WORKERS)?;
        Ok(())
    }
}

impl LogProducer for Ping {
    fn set_logger(&mut self, span: Span) {
        self.span = span;
    }
}

#[async_trait]
impl Module for Ping {
    fn name(&self) -> &'static str {
        PING
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_NETWORK]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx).await?)
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }

    fn as_log_producer(&mut self) -> Option<&mut dyn LogProducer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubRunner;
    use sitrep_store::MemoryStore;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[test]
    fn test_sweep_targets() {
        let lan = Subnetwork::from_prefix("192.168.1.10".parse().unwrap(), 24);
        let targets = sweep_targets(&lan).unwrap();
        assert_eq!(targets.len(), 254);
        assert_eq!(targets[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(targets[253], Ipv4Addr::new(192, 168, 1, 254));

        let wide = Subnetwork::from_prefix("10.0.0.1".parse().unwrap(), 16);
        assert!(sweep_targets(&wide).is_none());

        let vpn = Subnetwork::from_prefix("10.8.0.6".parse().unwrap(), 30);
        assert_eq!(sweep_targets(&vpn).unwrap().len(), 254);

        let public = Subnetwork::from_prefix("203.0.113.9".parse().unwrap(), 31);
        assert_eq!(
            sweep_targets(&public).unwrap(),
            vec![Ipv4Addr::new(203, 0, 113, 8), Ipv4Addr::new(203, 0, 113, 9)]
        );
    }

    async fn host_on_lan(store: &Arc<dyn InventoryStore>) {
        let host = store.ensure_host().await.unwrap();
        let ip: IpAddr = "192.168.1.10".parse().unwrap();
        let nic = store
            .put(NetworkInterface {
                machine_id: host.id,
                name: "eth0".to_string(),
                mac: "02:00:00:00:00:01".to_string(),
                ips: vec![ip],
                mask_size: 24,
                ..NetworkInterface::default()
            })
            .await
            .unwrap();
        let subnet = store.put(Subnetwork::from_prefix(ip, 24)).await.unwrap();
        store
            .put(NetworkInterfaceSubnet {
                nic_id: nic.id,
                subnet_id: subnet.id,
                ip: Some(ip),
                ..NetworkInterfaceSubnet::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_records_answering_hosts() {
        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new(Uuid::new_v4()));
        host_on_lan(&store).await;

        let runner = Arc::new(
            StubRunner::new()
                .with_failure("ping", 1, "")
                .with_output("ping -n -c 1 -W 1 192.168.1.1", "1 received")
                .with_output("ping -n -c 1 -W 1 192.168.1.10", "1 received")
                .with_output("ping -n -c 1 -W 1 192.168.1.20", "1 received"),
        );
        let ping = Ping::new(Arc::clone(&runner) as Arc<dyn CommandRunner>);
        let ctx = ModuleContext::new(CancellationToken::new(), Arc::clone(&store), Span::none());
        ping.collect(&ctx).await.unwrap();
        ping.collect(&ctx).await.unwrap();

        let machines: Vec<Machine> = store.iterate_machines().await.unwrap().collect();
        assert_eq!(machines.len(), 3);
        for addr in ["192.168.1.1", "192.168.1.20"] {
            let found = store
                .find_machine_by(MachineLookup::Ip(addr.parse().unwrap()))
                .await
                .unwrap()
                .unwrap();
            assert!(!found.is_host());
        }
        assert!(
            !runner
                .calls()
                .iter()
                .any(|call| call.ends_with(" 192.168.1.10"))
        );

        let payload = store.snapshot_payload().await.unwrap();
        let neighbour = payload
            .machines
            .iter()
            .find(|m| !m.machine.is_host())
            .unwrap();
        assert_eq!(neighbour.nics[0].subnetworks.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_ping_is_unsupported() {
        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new(Uuid::new_v4()));
        host_on_lan(&store).await;

        let ctx = ModuleContext::new(CancellationToken::new(), Arc::clone(&store), Span::none());
        let err = Ping::new(Arc::new(StubRunner::new()))
            .collect(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Unsupported(_)));
        assert_eq!(store.iterate_machines().await.unwrap().count(), 1);
    }
}
