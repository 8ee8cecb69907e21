//! Inventory entity definitions
//!
//! Every entity carries an `id` (0 until the store assigns one) and the
//! `created_at` / `updated_at` watermarks maintained by the store. Entities
//! reference each other by id only.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;

// ============================================================================
// Machines and hardware
// ============================================================================

/// A physical host, virtual machine, container or discovered neighbour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Store-assigned identifier
    #[serde(default)]
    pub id: i64,
    /// Agent identity; only set on the machine running the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Uuid>,
    /// Hostname
    #[serde(default)]
    pub hostname: String,
    /// Stable host identifier (machine-id, DMI uuid)
    #[serde(default)]
    pub host_id: String,
    /// Architecture (`x86_64`, `aarch64`, ...)
    #[serde(default)]
    pub arch: String,
    /// Platform (linux, windows, macos)
    #[serde(default)]
    pub platform: String,
    /// Distribution name
    #[serde(default)]
    pub distribution: String,
    /// Distribution version
    #[serde(default)]
    pub distribution_version: String,
    /// Space separated distributions this one derives from (os-release `ID_LIKE`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub distribution_like: String,
    /// Chassis type (laptop, server, vm, container)
    #[serde(default)]
    pub chassis: String,
    /// Uptime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    /// Parent machine for containers and virtual machines (0 when none)
    #[serde(default)]
    pub parent_machine_id: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Machine {
    /// Whether this machine is the one running the agent
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.agent.is_some()
    }
}

/// CPU package installed in a machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    #[serde(default)]
    pub id: i64,
    pub machine_id: i64,
    /// Model name as reported by the kernel
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub vendor: String,
    /// Logical core count
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Graphics adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gpu {
    #[serde(default)]
    pub id: i64,
    pub machine_id: i64,
    /// Adapter index on the machine
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Block device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    #[serde(default)]
    pub id: i64,
    pub machine_id: i64,
    /// Device name (`sda`, `nvme0n1`)
    pub name: String,
    #[serde(default)]
    pub model: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Disk kind (ssd, hdd, unknown)
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Networking
// ============================================================================

/// Interface flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceFlags {
    #[serde(default)]
    pub up: bool,
    #[serde(default)]
    pub loopback: bool,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub multicast: bool,
    #[serde(default)]
    pub point_to_point: bool,
    #[serde(default)]
    pub running: bool,
}

impl InterfaceFlags {
    /// Parse the flag list printed by `ip -j addr` (`["BROADCAST","UP",...]`)
    #[must_use]
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut flags = Self::default();
        for name in names {
            match name.to_ascii_uppercase().as_str() {
                "UP" => flags.up = true,
                "LOOPBACK" => flags.loopback = true,
                "BROADCAST" => flags.broadcast = true,
                "MULTICAST" => flags.multicast = true,
                "POINTOPOINT" | "POINT_TO_POINT" => flags.point_to_point = true,
                "LOWER_UP" | "RUNNING" => flags.running = true,
                _ => {}
            }
        }
        flags
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn merge(&mut self, other: Self) {
        if !other.is_empty() {
            *self = other;
        }
    }
}

/// Network interface card attached to a machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub id: i64,
    pub machine_id: i64,
    /// Interface name (`eth0`); empty for interfaces seen from the outside
    #[serde(default)]
    pub name: String,
    /// Hardware address, lower-case colon separated
    #[serde(default)]
    pub mac: String,
    /// Assigned addresses, mixed v4/v6
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub mask_size: u8,
    #[serde(default)]
    pub flags: InterfaceFlags,
    /// Source tag distinguishing overlapping views (docker, vpn, ...)
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NetworkInterface {
    /// Whether the interface owns this address
    #[must_use]
    pub fn has_ip(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip)
    }

    /// Add addresses not already present
    pub fn add_ips(&mut self, ips: impl IntoIterator<Item = IpAddr>) {
        for ip in ips {
            if !self.ips.contains(&ip) {
                self.ips.push(ip);
            }
        }
    }
}

/// IP network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnetwork {
    #[serde(default)]
    pub id: i64,
    /// Network in CIDR notation (`192.168.1.0/24`)
    pub cidr: String,
    /// Network address (`192.168.1.0`)
    #[serde(default)]
    pub network_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub mask_size: u8,
    /// 4 or 6
    #[serde(default)]
    pub ip_version: u8,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Subnetwork {
    /// Build a subnetwork from an address and prefix length, masking host bits
    #[must_use]
    pub fn from_prefix(ip: IpAddr, mask_size: u8) -> Self {
        let network = mask_addr(ip, mask_size);
        Self {
            cidr: format!("{network}/{mask_size}"),
            network_addr: network.to_string(),
            mask_size,
            ip_version: if ip.is_ipv4() { 4 } else { 6 },
            ..Self::default()
        }
    }

    /// Whether `ip` falls inside this network
    #[must_use]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let Ok(network) = self.network_addr.parse::<IpAddr>() else {
            return false;
        };
        network.is_ipv4() == ip.is_ipv4() && mask_addr(*ip, self.mask_size) == network
    }
}

fn mask_addr(ip: IpAddr, mask_size: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - u32::from(mask_size.min(32))).unwrap_or(0);
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = u128::MAX
                .checked_shl(128 - u32::from(mask_size.min(128)))
                .unwrap_or(0);
            IpAddr::V6((bits & mask).into())
        }
    }
}

/// Join between a network interface and a subnetwork
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceSubnet {
    #[serde(default)]
    pub id: i64,
    pub nic_id: i64,
    pub subnet_id: i64,
    /// Address the interface holds in this network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// Derived key `<mac>@<cidr>`
    #[serde(default)]
    pub mac_subnet: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NetworkInterfaceSubnet {
    /// Build the derived `(mac, subnet)` key
    #[must_use]
    pub fn derive_key(mac: &str, cidr: &str) -> String {
        if mac.is_empty() || cidr.is_empty() {
            String::new()
        } else {
            format!("{mac}@{cidr}")
        }
    }
}

// ============================================================================
// Applications
// ============================================================================

/// A running program
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    #[serde(default)]
    pub id: i64,
    pub machine_id: i64,
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Owning process user
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp6" => Ok(Protocol::Tcp),
            "udp" | "udp6" => Ok(Protocol::Udp),
            other => Err(ParseError::UnknownVariant {
                kind: "protocol",
                value: other.to_string(),
            }),
        }
    }
}

/// Address/port/protocol triple bound to a network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationEndpoint {
    #[serde(default)]
    pub id: i64,
    /// Owning application (0 when the process is unknown, e.g. remote scans)
    #[serde(default)]
    pub application_id: i64,
    pub nic_id: i64,
    pub addr: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// Application-level protocols spoken on this endpoint (http, ssh, ...)
    #[serde(default)]
    pub application_protocols: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ApplicationEndpoint {
    fn default() -> Self {
        Self {
            id: 0,
            application_id: 0,
            nic_id: 0,
            addr: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
            protocol: Protocol::Tcp,
            application_protocols: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Action of an endpoint policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    #[default]
    Allow,
    Deny,
    Forward,
    Nat,
}

impl PolicyAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Deny => "deny",
            PolicyAction::Forward => "forward",
            PolicyAction::Nat => "nat",
        }
    }
}

impl FromStr for PolicyAction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(PolicyAction::Allow),
            "deny" => Ok(PolicyAction::Deny),
            "forward" => Ok(PolicyAction::Forward),
            "nat" => Ok(PolicyAction::Nat),
            other => Err(ParseError::UnknownVariant {
                kind: "policy action",
                value: other.to_string(),
            }),
        }
    }
}

/// Directed rule between two endpoints (e.g. a published container port)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    #[serde(default)]
    pub id: i64,
    pub endpoint_id: i64,
    #[serde(default)]
    pub action: PolicyAction,
    /// Source endpoint (0 when the source is only known by address)
    #[serde(default)]
    pub src_endpoint_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_addr: Option<IpAddr>,
    #[serde(default)]
    pub priority: i32,
    /// Which collector produced the rule
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Packages
// ============================================================================

/// Installed software package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub id: i64,
    pub machine_id: i64,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub vendor: String,
    /// Package manager (dpkg, rpm)
    #[serde(default)]
    pub manager: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Merging
// ============================================================================

/// Field-wise merge where set values in `incoming` override stored ones
pub trait Merge {
    fn merge(&mut self, incoming: Self);
}

fn merge_str(slot: &mut String, value: String) {
    if !value.is_empty() {
        *slot = value;
    }
}

fn merge_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn merge_id(slot: &mut i64, value: i64) {
    if value != 0 {
        *slot = value;
    }
}

fn merge_vec<T>(slot: &mut Vec<T>, value: Vec<T>) {
    if !value.is_empty() {
        *slot = value;
    }
}

impl Merge for Machine {
    fn merge(&mut self, incoming: Self) {
        merge_opt(&mut self.agent, incoming.agent);
        merge_str(&mut self.hostname, incoming.hostname);
        merge_str(&mut self.host_id, incoming.host_id);
        merge_str(&mut self.arch, incoming.arch);
        merge_str(&mut self.platform, incoming.platform);
        merge_str(&mut self.distribution, incoming.distribution);
        merge_str(&mut self.distribution_version, incoming.distribution_version);
        merge_str(&mut self.distribution_like, incoming.distribution_like);
        merge_str(&mut self.chassis, incoming.chassis);
        merge_opt(&mut self.uptime, incoming.uptime);
        merge_id(&mut self.parent_machine_id, incoming.parent_machine_id);
    }
}

impl Merge for Cpu {
    fn merge(&mut self, incoming: Self) {
        merge_str(&mut self.model_name, incoming.model_name);
        merge_str(&mut self.vendor, incoming.vendor);
        if incoming.cores != 0 {
            self.cores = incoming.cores;
        }
    }
}

impl Merge for Gpu {
    fn merge(&mut self, incoming: Self) {
        merge_str(&mut self.vendor, incoming.vendor);
        merge_str(&mut self.product, incoming.product);
        merge_str(&mut self.driver, incoming.driver);
    }
}

impl Merge for Disk {
    fn merge(&mut self, incoming: Self) {
        merge_str(&mut self.model, incoming.model);
        merge_str(&mut self.kind, incoming.kind);
        if incoming.size != 0 {
            self.size = incoming.size;
        }
    }
}

impl Merge for NetworkInterface {
    fn merge(&mut self, incoming: Self) {
        merge_str(&mut self.name, incoming.name);
        merge_str(&mut self.mac, incoming.mac);
        // Addresses accumulate across collectors
        self.add_ips(incoming.ips);
        merge_opt(&mut self.gateway, incoming.gateway);
        if incoming.mask_size != 0 {
            self.mask_size = incoming.mask_size;
        }
        self.flags.merge(incoming.flags);
    }
}

impl Merge for Subnetwork {
    fn merge(&mut self, incoming: Self) {
        merge_str(&mut self.network_addr, incoming.network_addr);
        merge_opt(&mut self.gateway, incoming.gateway);
        if incoming.mask_size != 0 {
            self.mask_size = incoming.mask_size;
        }
        if incoming.ip_version != 0 {
            self.ip_version = incoming.ip_version;
        }
    }
}

impl Merge for NetworkInterfaceSubnet {
    fn merge(&mut self, incoming: Self) {
        merge_opt(&mut self.ip, incoming.ip);
        merge_str(&mut self.mac_subnet, incoming.mac_subnet);
    }
}

impl Merge for Application {
    fn merge(&mut self, incoming: Self) {
        merge_vec(&mut self.args, incoming.args);
        merge_opt(&mut self.pid, incoming.pid);
        merge_str(&mut self.user, incoming.user);
    }
}

impl Merge for ApplicationEndpoint {
    fn merge(&mut self, incoming: Self) {
        merge_id(&mut self.application_id, incoming.application_id);
        for proto in incoming.application_protocols {
            if !self.application_protocols.contains(&proto) {
                self.application_protocols.push(proto);
            }
        }
    }
}

impl Merge for EndpointPolicy {
    fn merge(&mut self, incoming: Self) {
        if incoming.priority != 0 {
            self.priority = incoming.priority;
        }
        merge_str(&mut self.source, incoming.source);
    }
}

impl Merge for Package {
    fn merge(&mut self, incoming: Self) {
        merge_str(&mut self.vendor, incoming.vendor);
        merge_opt(&mut self.install_time, incoming.install_time);
        merge_vec(&mut self.files, incoming.files);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnetwork_from_prefix_masks_host_bits() {
        let net = Subnetwork::from_prefix("192.168.1.37".parse().unwrap(), 24);
        assert_eq!(net.cidr, "192.168.1.0/24");
        assert_eq!(net.network_addr, "192.168.1.0");
        assert_eq!(net.ip_version, 4);
        assert!(net.contains(&"192.168.1.200".parse().unwrap()));
        assert!(!net.contains(&"192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn test_subnetwork_v6() {
        let net = Subnetwork::from_prefix("fe80::1c2:3ff:fe04:506".parse().unwrap(), 64);
        assert_eq!(net.cidr, "fe80::/64");
        assert_eq!(net.ip_version, 6);
        assert!(!net.contains(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_interface_flags_from_names() {
        let flags = InterfaceFlags::from_names(["BROADCAST", "MULTICAST", "UP", "LOWER_UP"]);
        assert!(flags.up && flags.broadcast && flags.multicast && flags.running);
        assert!(!flags.loopback);
    }

    #[test]
    fn test_nic_merge_accumulates_ips() {
        let mut stored = NetworkInterface {
            name: "eth0".to_string(),
            ips: vec!["10.0.0.2".parse().unwrap()],
            ..Default::default()
        };
        stored.merge(NetworkInterface {
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            ips: vec!["10.0.0.2".parse().unwrap(), "fe80::1".parse().unwrap()],
            ..Default::default()
        });
        assert_eq!(stored.name, "eth0");
        assert_eq!(stored.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(stored.ips.len(), 2);
    }

    #[test]
    fn test_machine_merge_keeps_unset_fields() {
        let mut stored = Machine {
            hostname: "box".to_string(),
            arch: "x86_64".to_string(),
            ..Default::default()
        };
        stored.merge(Machine {
            hostname: "box.lan".to_string(),
            ..Default::default()
        });
        assert_eq!(stored.hostname, "box.lan");
        assert_eq!(stored.arch, "x86_64");
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP6".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!("sctp".parse::<Protocol>().is_err());
    }
}
