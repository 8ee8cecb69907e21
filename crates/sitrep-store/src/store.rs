//! Inventory store contract

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sitrep_api::{
    Application, ApplicationEndpoint, Machine, NetworkInterface, Payload, Protocol, Subnetwork,
};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::record::{Entity, Record};

/// How `upsert` resolves a unique-key conflict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnConflict {
    /// Merge into the stored row
    #[default]
    Update,
    /// Keep the stored row unchanged and return it
    DoNothing,
    /// Surface `StoreError::UniqueViolation`
    Fail,
}

/// Ways to resolve a machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineLookup {
    HostId(String),
    IpMac(IpAddr, String),
    Mac(String),
    Ip(IpAddr),
}

/// A listening endpoint together with the machine and application owning it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub machine: Machine,
    /// Unknown for ports discovered from the outside
    pub application: Option<Application>,
    pub endpoint: ApplicationEndpoint,
}

/// Restartable iterator over the machines present when it was created
///
/// Mutations made after `iterate_machines` returns are not observed; clone the
/// iterator (or call [`MachineIter::restart`]) to walk the same snapshot again.
#[derive(Debug, Clone)]
pub struct MachineIter {
    machines: Arc<[Machine]>,
    pos: usize,
}

impl MachineIter {
    #[must_use]
    pub fn new(machines: Vec<Machine>) -> Self {
        Self {
            machines: machines.into(),
            pos: 0,
        }
    }

    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for MachineIter {
    type Item = Machine;

    fn next(&mut self) -> Option<Self::Item> {
        let machine = self.machines.get(self.pos)?.clone();
        self.pos += 1;
        Some(machine)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.machines.len().saturating_sub(self.pos);
        (remaining, Some(remaining))
    }
}

/// Shared inventory every module reads from and writes to
///
/// All operations are safe under concurrent callers.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Agent identity marking the host machine
    fn agent(&self) -> Uuid;

    /// Insert or merge an entity by its unique keys
    ///
    /// # Errors
    /// Returns `UniqueViolation` only for conflicts `on_conflict` does not
    /// resolve, `MissingParent` for dangling references.
    async fn upsert(&self, entity: Entity, on_conflict: OnConflict) -> Result<Entity>;

    /// The machine running the agent
    async fn get_host(&self) -> Result<Option<Machine>>;

    /// Resolve a machine; empty strings never match
    async fn find_machine_by(&self, lookup: MachineLookup) -> Result<Option<Machine>>;

    /// Endpoints listening on `port` over `protocol`, in endpoint id order
    async fn find_listeners(&self, port: u16, protocol: Protocol) -> Result<Vec<Listener>>;

    /// Machines with a TCP endpoint on `port`
    async fn find_tcp_listeners(&self, port: u16) -> Result<Vec<Listener>> {
        self.find_listeners(port, Protocol::Tcp).await
    }

    /// Snapshot iterator over all machines
    async fn iterate_machines(&self) -> Result<MachineIter>;

    /// Consistent payload of the whole inventory, machines in id order
    async fn snapshot_payload(&self) -> Result<Payload>;

    async fn nics_of(&self, machine_id: i64) -> Result<Vec<NetworkInterface>>;

    async fn subnetworks(&self) -> Result<Vec<Subnetwork>>;

    /// Subnetworks with `ip_version == 4`
    async fn all_ipv4_networks(&self) -> Result<Vec<Subnetwork>>;

    async fn applications_of(&self, machine_id: i64) -> Result<Vec<Application>>;

    /// Endpoints bound to any interface of the machine
    async fn endpoints_of(&self, machine_id: i64) -> Result<Vec<ApplicationEndpoint>>;

    /// Drop every row
    async fn clear(&self) -> Result<()>;
}

/// Typed helpers over [`InventoryStore::upsert`]
#[async_trait]
pub trait InventoryStoreExt: InventoryStore {
    /// Upsert merging into any existing row
    ///
    /// # Errors
    /// See [`InventoryStore::upsert`].
    async fn put<R: Record>(&self, record: R) -> Result<R> {
        typed(self.upsert(record.into_entity(), OnConflict::Update).await?)
    }

    /// Insert unless a row with the same key exists, returning the stored row
    ///
    /// # Errors
    /// See [`InventoryStore::upsert`].
    async fn insert_or_keep<R: Record>(&self, record: R) -> Result<R> {
        typed(self.upsert(record.into_entity(), OnConflict::DoNothing).await?)
    }

    /// Create the host machine when absent
    ///
    /// # Errors
    /// See [`InventoryStore::upsert`].
    async fn ensure_host(&self) -> Result<Machine> {
        if let Some(host) = self.get_host().await? {
            return Ok(host);
        }
        self.put(Machine {
            agent: Some(self.agent()),
            ..Machine::default()
        })
        .await
    }
}

impl<S: InventoryStore + ?Sized> InventoryStoreExt for S {}

fn typed<R: Record>(entity: Entity) -> Result<R> {
    let actual = entity.kind();
    R::from_entity(entity).ok_or(StoreError::KindMismatch {
        expected: R::KIND,
        actual,
    })
}
