//! Application protocol tagging by well-known port

use async_trait::async_trait;
use sitrep_api::{ApplicationEndpoint, Protocol};
use sitrep_core::{Module, ModuleContext, ModuleError};
use sitrep_store::{InventoryStore, InventoryStoreExt};
use tracing::{debug, info};

use crate::error::{CollectorError, Result};
use crate::netstat::NETSTAT;
use crate::scan::TCP_SCAN;

pub const STANDARD_PROTOCOL: &str = "standard-protocol";

/// IANA TCP assignments for services commonly found on a LAN
pub const WELL_KNOWN_TCP_PORTS: &[(u16, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "dns"),
    (80, "http"),
    (110, "pop3"),
    (143, "imap"),
    (389, "ldap"),
    (443, "https"),
    (445, "smb"),
    (631, "ipp"),
    (993, "imaps"),
    (3306, "mysql"),
    (3389, "rdp"),
    (5432, "postgresql"),
    (5900, "vnc"),
    (6379, "redis"),
    (8080, "http"),
    (8443, "https"),
    (9200, "elasticsearch"),
    (27017, "mongodb"),
];

pub const WELL_KNOWN_UDP_PORTS: &[(u16, &str)] = &[
    (7, "echo"),
    (53, "dns"),
    (67, "dhcp"),
    (68, "dhcp"),
    (69, "tftp"),
    (88, "kerberos"),
    (111, "onc-rpc"),
    (123, "ntp"),
    (137, "netbios-ns"),
    (138, "netbios-dgm"),
    (161, "snmp"),
    (162, "snmp-trap"),
    (443, "quic"),
    (500, "isakmp"),
    (514, "syslog"),
    (546, "dhcpv6-client"),
    (547, "dhcpv6-server"),
    (623, "ipmi"),
    (1194, "openvpn"),
    (1812, "radius"),
    (1900, "ssdp"),
    (2049, "nfs"),
    (3478, "stun"),
    (4500, "ipsec-nat"),
    (5060, "sip"),
    (5353, "mdns"),
    (5355, "llmnr"),
    (11211, "memcached"),
];

fn well_known(protocol: Protocol) -> &'static [(u16, &'static str)] {
    match protocol {
        Protocol::Tcp => WELL_KNOWN_TCP_PORTS,
        Protocol::Udp => WELL_KNOWN_UDP_PORTS,
    }
}

/// Tags listeners with the protocol their port is assigned to
///
/// Endpoints that already carry application protocols are left alone.
#[derive(Default)]
pub struct StandardProtocol;

impl StandardProtocol {
    async fn collect(&self, ctx: &ModuleContext) -> Result<()> {
        let store: &dyn InventoryStore = ctx.store.as_ref();
        for transport in [Protocol::Tcp, Protocol::Udp] {
            let mut tagged = 0usize;
            for &(port, protocol) in well_known(transport) {
                if ctx.cancel.is_cancelled() {
                    return Err(CollectorError::Cancelled(STANDARD_PROTOCOL.to_string()));
                }
                for listener in store.find_listeners(port, transport).await? {
                    if !listener.endpoint.application_protocols.is_empty() {
                        continue;
                    }
                    debug!(
                        machine = listener.machine.id,
                        addr = %listener.endpoint.addr,
                        port,
                        protocol,
                        "tagging endpoint"
                    );
                    store
                        .put(ApplicationEndpoint {
                            application_protocols: vec![protocol.to_string()],
                            ..listener.endpoint
                        })
                        .await?;
                    tagged += 1;
                }
            }
            info!(transport = transport.as_str(), tagged, "well-known listeners tagged");
        }
        Ok(())
    }
}

#[async_trait]
impl Module for StandardProtocol {
    fn name(&self) -> &'static str {
        STANDARD_PROTOCOL
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[NETSTAT, TCP_SCAN]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use sitrep_api::NetworkInterface;
    use sitrep_store::MemoryStore;
    use tokio_util::sync::CancellationToken;
    use tracing::Span;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_tags_by_transport() {
        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new(Uuid::new_v4()));
        let host = store.ensure_host().await.unwrap();
        let nic = store
            .put(NetworkInterface {
                machine_id: host.id,
                name: "eth0".to_string(),
                ips: vec!["10.0.0.2".parse().unwrap()],
                ..NetworkInterface::default()
            })
            .await
            .unwrap();
        let listeners = [
            (22, Protocol::Tcp, vec![]),
            (53, Protocol::Udp, vec![]),
            (123, Protocol::Tcp, vec![]),
            (4000, Protocol::Tcp, vec![]),
            (8080, Protocol::Tcp, vec!["grafana".to_string()]),
            (5353, Protocol::Udp, vec![]),
        ];
        for (port, protocol, application_protocols) in listeners {
            store
                .put(ApplicationEndpoint {
                    nic_id: nic.id,
                    addr: "10.0.0.2".parse().unwrap(),
                    port,
                    protocol,
                    application_protocols,
                    ..ApplicationEndpoint::default()
                })
                .await
                .unwrap();
        }

        let ctx = ModuleContext::new(CancellationToken::new(), Arc::clone(&store), Span::none());
        StandardProtocol.collect(&ctx).await.unwrap();
        StandardProtocol.collect(&ctx).await.unwrap();

        let endpoints = store.endpoints_of(host.id).await.unwrap();
        let tags = |port: u16| {
            endpoints
                .iter()
                .find(|e| e.port == port)
                .unwrap()
                .application_protocols
                .clone()
        };
        assert_eq!(tags(22), vec!["ssh".to_string()]);
        assert_eq!(tags(53), vec!["dns".to_string()]);
        assert_eq!(tags(5353), vec!["mdns".to_string()]);
        assert!(tags(123).is_empty());
        assert!(tags(4000).is_empty());
        assert_eq!(tags(8080), vec!["grafana".to_string()]);
    }
}
