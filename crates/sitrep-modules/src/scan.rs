//! TCP connect attempts against discovered neighbours

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sitrep_api::{ApplicationEndpoint, Protocol};
use sitrep_core::{
    ConfigError, ConfigKind, ConfigRegistry, Configurable, LogProducer, Module, ModuleContext,
    ModuleError,
};
use sitrep_exec::WorkerPool;
use sitrep_store::{InventoryStore, InventoryStoreExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{Instrument, Span, debug, info, trace};

use crate::error::{CollectorError, Result};
use crate::network::ARP;

pub const TCP_SCAN: &str = "tcp-scan";

const PORTS: &str = "tcp-scan.ports";
const WORKERS: &str = "tcp-scan.workers";
const TIMEOUT_MS: &str = "tcp-scan.timeout-ms";

const DEFAULT_PORTS: [&str; 8] = ["21", "22", "80", "443", "3306", "5432", "6379", "8080"];

#[derive(Debug, Clone, Copy)]
struct Target {
    nic_id: i64,
    ip: IpAddr,
    port: u16,
}

/// Connect scan of every neighbour address on a fixed port list
pub struct TcpScan {
    ports: Vec<u16>,
    workers: usize,
    timeout: Duration,
    span: Span,
}

impl Default for TcpScan {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PORTS.iter().filter_map(|p| p.parse().ok()).collect(),
            workers: 16,
            timeout: Duration::from_millis(500),
            span: Span::none(),
        }
    }
}

impl TcpScan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn targets(&self, store: &dyn InventoryStore) -> Result<Vec<Target>> {
        let mut targets = Vec::new();
        for machine in store.iterate_machines().await?.filter(|m| !m.is_host()) {
            for nic in store.nics_of(machine.id).await? {
                for ip in &nic.ips {
                    targets.extend(self.ports.iter().map(|&port| Target {
                        nic_id: nic.id,
                        ip: *ip,
                        port,
                    }));
                }
            }
        }
        Ok(targets)
    }

    async fn collect(&self, ctx: &ModuleContext) -> Result<()> {
        let targets = self.targets(ctx.store.as_ref()).await?;
        if targets.is_empty() {
            debug!("no neighbour to scan");
            return Ok(());
        }
        let total = targets.len();
        let pool = WorkerPool::new(self.workers, ctx.cancel.clone());
        let timeout = self.timeout;

        let result = pool
            .run(targets, |target| {
                let store = Arc::clone(&ctx.store);
                async move { connect(store.as_ref(), target, timeout).await }
            })
            .instrument(self.span.clone())
            .await;

        match result {
            Ok(processed) => {
                info!(attempts = processed, total, "scan complete");
                Ok(())
            }
            Err(e) if e.cancelled => Err(CollectorError::Cancelled(TCP_SCAN.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

async fn connect(store: &dyn InventoryStore, target: Target, timeout: Duration) -> Result<()> {
    let addr = SocketAddr::new(target.ip, target.port);
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            debug!(%addr, "port open");
            store
                .put(ApplicationEndpoint {
                    nic_id: target.nic_id,
                    addr: target.ip,
                    port: target.port,
                    protocol: Protocol::Tcp,
                    ..ApplicationEndpoint::default()
                })
                .await?;
        }
        Ok(Err(e)) => trace!(%addr, error = %e, "port closed"),
        Err(_) => trace!(%addr, "connect timed out"),
    }
    Ok(())
}

impl Configurable for TcpScan {
    fn bind(&self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.define(PORTS, &DEFAULT_PORTS[..], "TCP ports tried on every neighbour")?;
        config.define(WORKERS, 16u64, "Concurrent TCP connects")?;
        config.define(TIMEOUT_MS, 500u64, "Connect timeout in milliseconds")?;
        Ok(())
    }

    fn configure(&mut self, config: &ConfigRegistry) -> Result<(), ConfigError> {
        let ports: Vec<String> = config.get(PORTS)?;
        self.ports = ports
            .iter()
            .map(|p| {
                p.trim().parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                    key: PORTS.to_string(),
                    kind: ConfigKind::List,
                    value: p.clone(),
                })
            })
            .collect::<Result<_, _>>()?;
        self.workers = config.get(WORKERS)?;
        self.timeout = Duration::from_millis(config.get(TIMEOUT_MS)?);
        Ok(())
    }
}

impl LogProducer for TcpScan {
    fn set_logger(&mut self, span: Span) {
        self.span = span;
    }
}

#[async_trait]
impl Module for TcpScan {
    fn name(&self) -> &'static str {
        TCP_SCAN
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[ARP]
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
