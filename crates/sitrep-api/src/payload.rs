//! Payload handed to output backends

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inventory::{
    Application, ApplicationEndpoint, Cpu, Disk, EndpointPolicy, Gpu, Machine, NetworkInterface,
    Package, Subnetwork,
};

/// Immutable snapshot of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub machines: Vec<MachineReport>,
    pub extra: ExtraInfo,
}

impl Payload {
    /// The machine carrying the agent id, if any
    #[must_use]
    pub fn host(&self) -> Option<&MachineReport> {
        self.machines.iter().find(|m| m.machine.is_host())
    }

    /// Sort every list by a content key so payloads from different stores compare equal
    #[must_use]
    pub fn normalized(mut self) -> Self {
        for report in &mut self.machines {
            report.nics.sort_by(|a, b| {
                (&a.nic.mac, &a.nic.name, &a.nic.tag).cmp(&(&b.nic.mac, &b.nic.name, &b.nic.tag))
            });
            for nic in &mut report.nics {
                nic.subnetworks.sort_by(|a, b| (&a.cidr, &a.tag).cmp(&(&b.cidr, &b.tag)));
            }
            report.cpus.sort_by(|a, b| a.model_name.cmp(&b.model_name));
            report.gpus.sort_by_key(|g| g.index);
            report.disks.sort_by(|a, b| a.name.cmp(&b.name));
            report.packages.sort_by(|a, b| {
                (&a.manager, &a.name, &a.version).cmp(&(&b.manager, &b.name, &b.version))
            });
            report.applications.sort_by(|a, b| a.name.cmp(&b.name));
            report.endpoints.sort_by(|a, b| {
                (a.endpoint.addr, a.endpoint.port, a.endpoint.protocol).cmp(&(
                    b.endpoint.addr,
                    b.endpoint.port,
                    b.endpoint.protocol,
                ))
            });
        }
        self.machines.sort_by(|a, b| {
            (!a.machine.is_host(), &a.machine.host_id, &a.machine.hostname).cmp(&(
                !b.machine.is_host(),
                &b.machine.host_id,
                &b.machine.hostname,
            ))
        });
        self
    }
}

/// A machine together with everything it owns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineReport {
    #[serde(flatten)]
    pub machine: Machine,
    #[serde(default)]
    pub cpus: Vec<Cpu>,
    #[serde(default)]
    pub gpus: Vec<Gpu>,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub nics: Vec<NicReport>,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub applications: Vec<Application>,
    /// Endpoints bound to any of this machine's interfaces
    #[serde(default)]
    pub endpoints: Vec<EndpointReport>,
}

/// A network interface with the subnetworks it is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicReport {
    #[serde(flatten)]
    pub nic: NetworkInterface,
    #[serde(default)]
    pub subnetworks: Vec<Subnetwork>,
}

/// An endpoint with the policies targeting it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointReport {
    #[serde(flatten)]
    pub endpoint: ApplicationEndpoint,
    #[serde(default)]
    pub policies: Vec<EndpointPolicy>,
}

/// Run metadata attached to every payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraInfo {
    /// Agent identity
    pub agent: Uuid,
    /// Agent version
    pub version: String,
    /// When the payload was assembled
    pub timestamp: DateTime<Utc>,
    /// Run duration, serialized as nanoseconds
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// Per-module failures, sorted by module name
    #[serde(default)]
    pub module_errors: Vec<ModuleErrorEntry>,
    #[serde(default)]
    pub perf: PerfStats,
}

impl Default for ExtraInfo {
    fn default() -> Self {
        Self {
            agent: Uuid::nil(),
            version: String::new(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            duration: Duration::ZERO,
            module_errors: Vec::new(),
            perf: PerfStats::default(),
        }
    }
}

/// A module that returned an error during the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleErrorEntry {
    pub module: String,
    pub message: String,
}

/// Process memory statistics at assembly time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfStats {
    /// Resident memory in bytes
    pub heap_alloc: u64,
    /// Virtual memory in bytes
    pub heap_sys: u64,
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{NetworkInterface, Protocol};

    fn sample() -> Payload {
        let host = Machine {
            id: 1,
            agent: Some(Uuid::new_v4()),
            hostname: "box".to_string(),
            host_id: "abc".to_string(),
            ..Default::default()
        };
        let nic = NetworkInterface {
            id: 1,
            machine_id: 1,
            name: "eth0".to_string(),
            mac: "02:00:00:00:00:01".to_string(),
            ips: vec!["10.0.0.2".parse().unwrap()],
            mask_size: 24,
            ..Default::default()
        };
        let endpoint = ApplicationEndpoint {
            id: 1,
            nic_id: 1,
            addr: "10.0.0.2".parse().unwrap(),
            port: 22,
            protocol: Protocol::Tcp,
            application_protocols: vec!["ssh".to_string()],
            ..Default::default()
        };
        Payload {
            machines: vec![MachineReport {
                machine: host,
                nics: vec![NicReport {
                    nic,
                    subnetworks: vec![Subnetwork::from_prefix("10.0.0.2".parse().unwrap(), 24)],
                }],
                endpoints: vec![EndpointReport {
                    endpoint,
                    policies: vec![],
                }],
                ..Default::default()
            }],
            extra: ExtraInfo {
                agent: Uuid::new_v4(),
                version: "0.1.0".to_string(),
                timestamp: Utc::now(),
                duration: Duration::from_millis(1500),
                module_errors: vec![ModuleErrorEntry {
                    module: "arp".to_string(),
                    message: "boom".to_string(),
                }],
                perf: PerfStats {
                    heap_alloc: 1,
                    heap_sys: 2,
                },
            },
        }
    }

    #[test]
    fn test_payload_json_round_trip() {
        let payload = sample();
        let json = serde_json::to_string(&payload).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_payload_shape() {
        let value = serde_json::to_value(sample()).unwrap();
        let machine = &value["machines"][0];
        assert_eq!(machine["hostname"], "box");
        assert_eq!(machine["nics"][0]["name"], "eth0");
        assert_eq!(machine["nics"][0]["subnetworks"][0]["cidr"], "10.0.0.0/24");
        assert_eq!(machine["endpoints"][0]["port"], 22);
        assert_eq!(value["extra"]["duration"], 1_500_000_000u64);
        assert_eq!(value["extra"]["module_errors"][0]["module"], "arp");
    }

    #[test]
    fn test_host_lookup() {
        let payload = sample();
        assert_eq!(payload.host().map(|m| m.machine.hostname.as_str()), Some("box"));
        assert!(Payload::default().host().is_none());
    }
}
