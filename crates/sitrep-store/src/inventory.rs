//! Normalized in-memory inventory
//!
//! [`Inventory`] holds one table per entity kind and implements the keyed
//! upsert and every read query. [`crate::MemoryStore`] wraps it in a lock;
//! [`crate::SqliteStore`] rehydrates one from the database for reads.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use sitrep_api::{
    Application, ApplicationEndpoint, Cpu, Disk, EndpointPolicy, EndpointReport, ExtraInfo, Gpu,
    Machine, MachineReport, NetworkInterface, NetworkInterfaceSubnet, NicReport, Package, Payload,
    Protocol, Subnetwork,
};

use crate::error::{Result, StoreError};
use crate::record::{Entity, EntityKind, KeyValue, Record};
use crate::store::{Listener, MachineLookup, OnConflict};

// ============================================================================
// Tables
// ============================================================================

/// Rows of one entity kind, keyed by id
///
/// Each unique group of `R` has a hash index from its key values to the
/// owning row, so conflict detection stays constant time per group.
#[derive(Debug, Clone)]
pub struct Table<R> {
    rows: BTreeMap<i64, R>,
    index: Vec<HashMap<Vec<KeyValue>, i64>>,
    next_id: i64,
}

impl<R: Record> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            index: vec![HashMap::new(); R::unique_keys().len()],
            next_id: 1,
        }
    }
}

impl<R: Record> Table<R> {
    #[must_use]
    pub fn get(&self, id: i64) -> Option<&R> {
        self.rows.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        self.rows.contains_key(&id)
    }

    /// Rows in id order
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First row other than `exclude` sharing an active unique group with `record`
    fn find_conflict(&self, record: &R, exclude: i64) -> Option<i64> {
        R::unique_keys()
            .iter()
            .zip(&self.index)
            .find_map(|(group, index)| {
                let values = record.key_values(group)?;
                index.get(&values).copied().filter(|id| *id != exclude)
            })
    }

    fn index_insert(&mut self, record: &R) {
        for (group, index) in R::unique_keys().iter().zip(&mut self.index) {
            if let Some(values) = record.key_values(group) {
                index.insert(values, record.id());
            }
        }
    }

    fn index_remove(&mut self, record: &R) {
        for (group, index) in R::unique_keys().iter().zip(&mut self.index) {
            let Some(values) = record.key_values(group) else {
                continue;
            };
            if index.get(&values) == Some(&record.id()) {
                index.remove(&values);
            }
        }
    }

    fn store(&mut self, record: R) {
        if let Some(previous) = self.rows.remove(&record.id()) {
            self.index_remove(&previous);
        }
        self.index_insert(&record);
        self.rows.insert(record.id(), record);
    }

    fn upsert(&mut self, mut record: R, on_conflict: OnConflict, now: DateTime<Utc>) -> Result<R> {
        let explicit = record.id() != 0;
        let existing = if explicit {
            if !self.contains(record.id()) {
                return Err(StoreError::NotFound {
                    kind: R::KIND,
                    id: record.id(),
                });
            }
            Some(record.id())
        } else {
            self.find_conflict(&record, 0)
        };

        let Some(id) = existing else {
            let id = self.next_id;
            self.next_id += 1;
            record.set_id(id);
            record.set_timestamps(Some(now), Some(now));
            self.store(record.clone());
            return Ok(record);
        };

        let stored = self.rows.get(&id).cloned().ok_or(StoreError::NotFound { kind: R::KIND, id })?;
        match on_conflict {
            OnConflict::DoNothing if !explicit => return Ok(stored),
            OnConflict::Fail if !explicit => {
                return Err(StoreError::UniqueViolation {
                    kind: R::KIND,
                    detail: format!("conflicts with #{id}"),
                });
            }
            _ => {}
        }

        let mut merged = stored;
        merged.merge(record);
        if let Some(other) = self.find_conflict(&merged, id) {
            return Err(StoreError::UniqueViolation {
                kind: R::KIND,
                detail: format!("#{id} would collide with #{other}"),
            });
        }
        let created_at = merged.created_at();
        merged.set_timestamps(created_at, Some(now));
        self.store(merged.clone());
        Ok(merged)
    }

    fn restore(&mut self, record: R) {
        self.next_id = self.next_id.max(record.id() + 1);
        self.store(record);
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.index.iter_mut().for_each(HashMap::clear);
        self.next_id = 1;
    }
}

trait HasTable: Record {
    fn table_mut(inventory: &mut Inventory) -> &mut Table<Self>;
}

macro_rules! has_table {
    ($($ty:ty => $field:ident),* $(,)?) => {
        $(
            impl HasTable for $ty {
                fn table_mut(inventory: &mut Inventory) -> &mut Table<Self> {
                    &mut inventory.$field
                }
            }
        )*
    };
}

has_table!(
    Machine => machines,
    Cpu => cpus,
    Gpu => gpus,
    Disk => disks,
    NetworkInterface => nics,
    Subnetwork => subnetworks,
    NetworkInterfaceSubnet => nic_subnets,
    Application => applications,
    ApplicationEndpoint => endpoints,
    EndpointPolicy => policies,
    Package => packages,
);

// ============================================================================
// Inventory
// ============================================================================

/// The full entity graph of one run
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub machines: Table<Machine>,
    pub cpus: Table<Cpu>,
    pub gpus: Table<Gpu>,
    pub disks: Table<Disk>,
    pub nics: Table<NetworkInterface>,
    pub subnetworks: Table<Subnetwork>,
    pub nic_subnets: Table<NetworkInterfaceSubnet>,
    pub applications: Table<Application>,
    pub endpoints: Table<ApplicationEndpoint>,
    pub policies: Table<EndpointPolicy>,
    pub packages: Table<Package>,
}

impl Inventory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge an entity by its unique keys
    ///
    /// # Errors
    /// Returns `MissingParent` for dangling references, `NotFound` for an
    /// unknown explicit id and `UniqueViolation` when `on_conflict` is
    /// [`OnConflict::Fail`] or a merge would collide with another row.
    pub fn upsert(
        &mut self,
        entity: Entity,
        on_conflict: OnConflict,
        now: DateTime<Utc>,
    ) -> Result<Entity> {
        match entity {
            Entity::Machine(r) => self.upsert_record(r, on_conflict, now).map(Entity::Machine),
            Entity::Cpu(r) => self.upsert_record(r, on_conflict, now).map(Entity::Cpu),
            Entity::Gpu(r) => self.upsert_record(r, on_conflict, now).map(Entity::Gpu),
            Entity::Disk(r) => self.upsert_record(r, on_conflict, now).map(Entity::Disk),
            Entity::NetworkInterface(r) => self
                .upsert_record(r, on_conflict, now)
                .map(Entity::NetworkInterface),
            Entity::Subnetwork(r) => self.upsert_record(r, on_conflict, now).map(Entity::Subnetwork),
            Entity::NetworkInterfaceSubnet(r) => self
                .upsert_record(r, on_conflict, now)
                .map(Entity::NetworkInterfaceSubnet),
            Entity::Application(r) => self.upsert_record(r, on_conflict, now).map(Entity::Application),
            Entity::ApplicationEndpoint(r) => self
                .upsert_record(r, on_conflict, now)
                .map(Entity::ApplicationEndpoint),
            Entity::EndpointPolicy(r) => self
                .upsert_record(r, on_conflict, now)
                .map(Entity::EndpointPolicy),
            Entity::Package(r) => self.upsert_record(r, on_conflict, now).map(Entity::Package),
        }
    }

    fn upsert_record<R: HasTable>(
        &mut self,
        record: R,
        on_conflict: OnConflict,
        now: DateTime<Utc>,
    ) -> Result<R> {
        self.check_parents(&record)?;
        R::table_mut(self).upsert(record, on_conflict, now)
    }

    /// Verify every parent a record references is present
    ///
    /// # Errors
    /// Returns `MissingParent` naming the first dangling reference.
    pub fn check_parents<R: Record>(&self, record: &R) -> Result<()> {
        for parent in record.parents() {
            let dangling = if parent.id == 0 {
                parent.required
            } else {
                !self.exists(parent.kind, parent.id)
            };
            if dangling {
                return Err(StoreError::MissingParent {
                    kind: R::KIND,
                    parent: parent.kind,
                    id: parent.id,
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn exists(&self, kind: EntityKind, id: i64) -> bool {
        match kind {
            EntityKind::Machine => self.machines.contains(id),
            EntityKind::Cpu => self.cpus.contains(id),
            EntityKind::Gpu => self.gpus.contains(id),
            EntityKind::Disk => self.disks.contains(id),
            EntityKind::NetworkInterface => self.nics.contains(id),
            EntityKind::Subnetwork => self.subnetworks.contains(id),
            EntityKind::NetworkInterfaceSubnet => self.nic_subnets.contains(id),
            EntityKind::Application => self.applications.contains(id),
            EntityKind::ApplicationEndpoint => self.endpoints.contains(id),
            EntityKind::EndpointPolicy => self.policies.contains(id),
            EntityKind::Package => self.packages.contains(id),
        }
    }

    /// Put back a row loaded from persistence, keeping its id
    pub fn restore(&mut self, entity: Entity) {
        match entity {
            Entity::Machine(r) => self.machines.restore(r),
            Entity::Cpu(r) => self.cpus.restore(r),
            Entity::Gpu(r) => self.gpus.restore(r),
            Entity::Disk(r) => self.disks.restore(r),
            Entity::NetworkInterface(r) => self.nics.restore(r),
            Entity::Subnetwork(r) => self.subnetworks.restore(r),
            Entity::NetworkInterfaceSubnet(r) => self.nic_subnets.restore(r),
            Entity::Application(r) => self.applications.restore(r),
            Entity::ApplicationEndpoint(r) => self.endpoints.restore(r),
            Entity::EndpointPolicy(r) => self.policies.restore(r),
            Entity::Package(r) => self.packages.restore(r),
        }
    }

    pub fn clear(&mut self) {
        self.machines.clear();
        self.cpus.clear();
        self.gpus.clear();
        self.disks.clear();
        self.nics.clear();
        self.subnetworks.clear();
        self.nic_subnets.clear();
        self.applications.clear();
        self.endpoints.clear();
        self.policies.clear();
        self.packages.clear();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The machine running the agent
    #[must_use]
    pub fn host(&self) -> Option<&Machine> {
        self.machines.iter().find(|m| m.is_host())
    }

    /// Resolve a machine by identity or network address
    ///
    /// Empty strings and unspecified addresses never match.
    #[must_use]
    pub fn find_machine_by(&self, lookup: &MachineLookup) -> Option<&Machine> {
        match lookup {
            MachineLookup::HostId(host_id) => {
                if host_id.is_empty() {
                    return None;
                }
                self.machines.iter().find(|m| &m.host_id == host_id)
            }
            MachineLookup::Mac(mac) => self.machine_of_nic(|nic| mac_matches(&nic.mac, mac)),
            MachineLookup::Ip(ip) => {
                if ip.is_unspecified() {
                    return None;
                }
                self.machine_of_nic(|nic| nic.has_ip(ip))
            }
            MachineLookup::IpMac(ip, mac) => {
                if ip.is_unspecified() {
                    return None;
                }
                self.machine_of_nic(|nic| nic.has_ip(ip) && mac_matches(&nic.mac, mac))
            }
        }
    }

    fn machine_of_nic(&self, pred: impl Fn(&NetworkInterface) -> bool) -> Option<&Machine> {
        self.nics
            .iter()
            .find(|nic| pred(nic))
            .and_then(|nic| self.machines.get(nic.machine_id))
    }

    /// Every endpoint listening on `port` over `protocol`, in endpoint id order
    #[must_use]
    pub fn listeners(&self, port: u16, protocol: Protocol) -> Vec<Listener> {
        self.endpoints
            .iter()
            .filter(|e| e.port == port && e.protocol == protocol)
            .filter_map(|endpoint| {
                let nic = self.nics.get(endpoint.nic_id)?;
                let machine = self.machines.get(nic.machine_id)?;
                Some(Listener {
                    machine: machine.clone(),
                    application: self.applications.get(endpoint.application_id).cloned(),
                    endpoint: endpoint.clone(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn machines(&self) -> Vec<Machine> {
        self.machines.iter().cloned().collect()
    }

    #[must_use]
    pub fn nics_of(&self, machine_id: i64) -> Vec<NetworkInterface> {
        self.nics
            .iter()
            .filter(|n| n.machine_id == machine_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn subnetworks(&self) -> Vec<Subnetwork> {
        self.subnetworks.iter().cloned().collect()
    }

    /// IPv4 networks any interface is attached to
    #[must_use]
    pub fn ipv4_networks(&self) -> Vec<Subnetwork> {
        self.subnetworks
            .iter()
            .filter(|s| s.ip_version == 4)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn applications_of(&self, machine_id: i64) -> Vec<Application> {
        self.applications
            .iter()
            .filter(|a| a.machine_id == machine_id)
            .cloned()
            .collect()
    }

    /// Endpoints bound to any interface of the machine
    #[must_use]
    pub fn endpoints_of(&self, machine_id: i64) -> Vec<ApplicationEndpoint> {
        self.endpoints
            .iter()
            .filter(|e| {
                self.nics
                    .get(e.nic_id)
                    .is_some_and(|nic| nic.machine_id == machine_id)
            })
            .cloned()
            .collect()
    }

    /// Build the nested payload view, machines in id order
    #[must_use]
    pub fn payload(&self) -> Payload {
        Payload {
            machines: self.machines.iter().map(|m| self.machine_report(m)).collect(),
            extra: ExtraInfo::default(),
        }
    }

    fn machine_report(&self, machine: &Machine) -> MachineReport {
        let nics: Vec<NicReport> = self
            .nics
            .iter()
            .filter(|n| n.machine_id == machine.id)
            .map(|nic| NicReport {
                nic: nic.clone(),
                subnetworks: self
                    .nic_subnets
                    .iter()
                    .filter(|join| join.nic_id == nic.id)
                    .filter_map(|join| self.subnetworks.get(join.subnet_id).cloned())
                    .collect(),
            })
            .collect();

        let endpoints = self
            .endpoints_of(machine.id)
            .into_iter()
            .map(|endpoint| EndpointReport {
                policies: self
                    .policies
                    .iter()
                    .filter(|p| p.endpoint_id == endpoint.id)
                    .cloned()
                    .collect(),
                endpoint,
            })
            .collect();

        MachineReport {
            machine: machine.clone(),
            cpus: owned_by(&self.cpus, machine.id, |c| c.machine_id),
            gpus: owned_by(&self.gpus, machine.id, |g| g.machine_id),
            disks: owned_by(&self.disks, machine.id, |d| d.machine_id),
            nics,
            packages: owned_by(&self.packages, machine.id, |p| p.machine_id),
            applications: self.applications_of(machine.id),
            endpoints,
        }
    }
}

fn owned_by<R: Record>(table: &Table<R>, machine_id: i64, owner: impl Fn(&R) -> i64) -> Vec<R> {
    table
        .iter()
        .filter(|r| owner(r) == machine_id)
        .cloned()
        .collect()
}

fn mac_matches(stored: &str, wanted: &str) -> bool {
    !wanted.is_empty() && stored.eq_ignore_ascii_case(wanted)
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use uuid::Uuid;

    fn host() -> Machine {
        Machine {
            agent: Some(Uuid::new_v4()),
            hostname: "box".to_string(),
            host_id: "h-1".to_string(),
            ..Default::default()
        }
    }

    fn put(inv: &mut Inventory, entity: impl Into<Entity>) -> Entity {
        inv.upsert(entity.into(), OnConflict::Update, Utc::now()).unwrap()
    }

    fn machine_id(entity: &Entity) -> i64 {
        match entity {
            Entity::Machine(m) => m.id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_upsert_is_idempotent_by_key() {
        let mut inv = Inventory::new();
        let first = machine_id(&put(&mut inv, host()));
        let second = machine_id(&put(
            &mut inv,
            Machine {
                host_id: "h-1".to_string(),
                arch: "x86_64".to_string(),
                ..Default::default()
            },
        ));
        assert_eq!(first, second);
        assert_eq!(inv.machines.len(), 1);
        let stored = inv.machines.get(first).unwrap();
        assert_eq!(stored.hostname, "box");
        assert_eq!(stored.arch, "x86_64");
        assert!(stored.updated_at >= stored.created_at);
    }

    #[test]
    fn test_host_singleton() {
        let mut inv = Inventory::new();
        put(&mut inv, host());
        put(
            &mut inv,
            Machine {
                agent: Some(Uuid::new_v4()),
                hostname: "renamed".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(inv.machines.iter().filter(|m| m.is_host()).count(), 1);
        assert_eq!(inv.host().unwrap().hostname, "renamed");
    }

    #[test]
    fn test_on_conflict_modes() {
        let mut inv = Inventory::new();
        let now = Utc::now();
        inv.upsert(host().into(), OnConflict::Fail, now).unwrap();

        let clash = Machine {
            host_id: "h-1".to_string(),
            hostname: "other".to_string(),
            ..Default::default()
        };
        let err = inv
            .upsert(clash.clone().into(), OnConflict::Fail, now)
            .unwrap_err();
        assert!(err.is_conflict());

        let kept = inv.upsert(clash.into(), OnConflict::DoNothing, now).unwrap();
        match kept {
            Entity::Machine(m) => assert_eq!(m.hostname, "box"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_parent() {
        let mut inv = Inventory::new();
        let err = inv
            .upsert(
                NetworkInterface {
                    machine_id: 42,
                    mac: "02:00:00:00:00:01".to_string(),
                    ..Default::default()
                }
                .into(),
                OnConflict::Update,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingParent { id: 42, .. }));
    }

    #[test]
    fn test_nic_uniqueness_per_machine() {
        let mut inv = Inventory::new();
        let id = machine_id(&put(&mut inv, host()));
        let nic = NetworkInterface {
            machine_id: id,
            name: "eth0".to_string(),
            mac: "02:00:00:00:00:01".to_string(),
            ..Default::default()
        };
        put(&mut inv, nic.clone());
        put(
            &mut inv,
            NetworkInterface {
                ips: vec!["10.0.0.2".parse().unwrap()],
                ..nic.clone()
            },
        );
        put(
            &mut inv,
            NetworkInterface {
                tag: "docker".to_string(),
                ..nic
            },
        );
        assert_eq!(inv.nics.len(), 2);
    }

    #[test]
    fn test_find_machine_by() {
        let mut inv = Inventory::new();
        let id = machine_id(&put(&mut inv, host()));
        put(
            &mut inv,
            NetworkInterface {
                machine_id: id,
                mac: "02:00:00:00:00:01".to_string(),
                ips: vec!["10.0.0.2".parse().unwrap()],
                ..Default::default()
            },
        );

        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(inv.find_machine_by(&MachineLookup::HostId("h-1".into())).is_some());
        assert!(inv.find_machine_by(&MachineLookup::HostId(String::new())).is_none());
        assert!(inv.find_machine_by(&MachineLookup::Mac("02:00:00:00:00:01".into())).is_some());
        assert!(inv.find_machine_by(&MachineLookup::Mac(String::new())).is_none());
        assert!(inv.find_machine_by(&MachineLookup::Ip(ip)).is_some());
        assert!(
            inv.find_machine_by(&MachineLookup::IpMac(ip, "02:00:00:00:00:02".into()))
                .is_none()
        );
        assert!(
            inv.find_machine_by(&MachineLookup::Ip("0.0.0.0".parse().unwrap()))
                .is_none()
        );
    }

    #[test]
    fn test_payload_nests_children() {
        let mut inv = Inventory::new();
        let id = machine_id(&put(&mut inv, host()));
        let nic = match put(
            &mut inv,
            NetworkInterface {
                machine_id: id,
                mac: "02:00:00:00:00:01".to_string(),
                ..Default::default()
            },
        ) {
            Entity::NetworkInterface(n) => n,
            other => panic!("unexpected {other:?}"),
        };
        put(
            &mut inv,
            ApplicationEndpoint {
                nic_id: nic.id,
                addr: "10.0.0.2".parse().unwrap(),
                port: 22,
                ..Default::default()
            },
        );

        let payload = inv.payload();
        assert_eq!(payload.machines.len(), 1);
        assert_eq!(payload.machines[0].nics.len(), 1);
        assert_eq!(payload.machines[0].endpoints.len(), 1);
        assert_eq!(inv.listeners(22, Protocol::Tcp).len(), 1);
        assert!(inv.listeners(22, Protocol::Udp).is_empty());
        assert!(inv.listeners(80, Protocol::Tcp).is_empty());
    }

    #[test]
    fn test_many_packages_stay_unique() {
        let mut inv = Inventory::new();
        let id = machine_id(&put(&mut inv, host()));
        let package = |n: usize| Package {
            machine_id: id,
            name: format!("pkg-{n}"),
            version: "1.0".to_string(),
            manager: "dpkg".to_string(),
            ..Default::default()
        };
        for n in 0..5000 {
            put(&mut inv, package(n));
        }
        for n in (0..5000).step_by(7) {
            put(
                &mut inv,
                Package {
                    vendor: "debian".to_string(),
                    ..package(n)
                },
            );
        }
        assert_eq!(inv.packages.len(), 5000);
        assert_eq!(inv.packages.get(1).unwrap().vendor, "debian");
        assert_eq!(inv.packages.get(2).unwrap().vendor, "");
    }

    #[test]
    fn test_key_index_follows_merges() {
        let mut inv = Inventory::new();
        let id = machine_id(&put(&mut inv, host()));
        put(
            &mut inv,
            Machine {
                id,
                host_id: "h-2".to_string(),
                ..Default::default()
            },
        );

        let moved = machine_id(&put(
            &mut inv,
            Machine {
                host_id: "h-2".to_string(),
                arch: "aarch64".to_string(),
                ..Default::default()
            },
        ));
        assert_eq!(moved, id);

        let fresh = machine_id(&put(
            &mut inv,
            Machine {
                host_id: "h-1".to_string(),
                ..Default::default()
            },
        ));
        assert_ne!(fresh, id);
        assert_eq!(inv.machines.len(), 2);
    }

    #[test]
    fn test_key_index_after_restore_and_clear() {
        let mut inv = Inventory::new();
        inv.restore(
            Machine {
                id: 7,
                host_id: "h-7".to_string(),
                ..Default::default()
            }
            .into(),
        );
        let merged = machine_id(&put(
            &mut inv,
            Machine {
                host_id: "h-7".to_string(),
                hostname: "restored".to_string(),
                ..Default::default()
            },
        ));
        assert_eq!(merged, 7);
        assert_eq!(inv.machines.len(), 1);

        inv.clear();
        let first = machine_id(&put(
            &mut inv,
            Machine {
                host_id: "h-7".to_string(),
                ..Default::default()
            },
        ));
        assert_eq!(first, 1);
        assert_eq!(inv.machines.get(1).unwrap().hostname, "");
    }
}
