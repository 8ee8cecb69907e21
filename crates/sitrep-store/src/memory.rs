//! Process-local inventory store for one-shot runs

use async_trait::async_trait;
use chrono::Utc;
use sitrep_api::{
    Application, ApplicationEndpoint, Machine, NetworkInterface, Payload, Protocol, Subnetwork,
};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::inventory::Inventory;
use crate::record::Entity;
use crate::store::{InventoryStore, Listener, MachineIter, MachineLookup, OnConflict};

/// In-memory store
///
/// Writers take the lock exclusively, so store operations are serializable.
/// Reads never fail.
pub struct MemoryStore {
    agent: Uuid,
    inner: RwLock<Inventory>,
}

impl MemoryStore {
    /// Create an empty store for the given agent
    #[must_use]
    pub fn new(agent: Uuid) -> Self {
        Self {
            agent,
            inner: RwLock::new(Inventory::new()),
        }
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    fn agent(&self) -> Uuid {
        self.agent
    }

    #[instrument(skip(self, entity), fields(kind = ?entity.kind()))]
    async fn upsert(&self, entity: Entity, on_conflict: OnConflict) -> Result<Entity> {
        let stored = self
            .inner
            .write()
            .await
            .upsert(entity, on_conflict, Utc::now())?;
        debug!("upserted");
        Ok(stored)
    }

    async fn get_host(&self) -> Result<Option<Machine>> {
        Ok(self.inner.read().await.host().cloned())
    }

    async fn find_machine_by(&self, lookup: MachineLookup) -> Result<Option<Machine>> {
        Ok(self.inner.read().await.find_machine_by(&lookup).cloned())
    }

    async fn find_listeners(&self, port: u16, protocol: Protocol) -> Result<Vec<Listener>> {
        Ok(self.inner.read().await.listeners(port, protocol))
    }

    async fn iterate_machines(&self) -> Result<MachineIter> {
        Ok(MachineIter::new(self.inner.read().await.machines()))
    }

    async fn snapshot_payload(&self) -> Result<Payload> {
        Ok(self.inner.read().await.payload())
    }

    async fn nics_of(&self, machine_id: i64) -> Result<Vec<NetworkInterface>> {
        Ok(self.inner.read().await.nics_of(machine_id))
    }

    async fn subnetworks(&self) -> Result<Vec<Subnetwork>> {
        Ok(self.inner.read().await.subnetworks())
    }

    async fn all_ipv4_networks(&self) -> Result<Vec<Subnetwork>> {
        Ok(self.inner.read().await.ipv4_networks())
    }

    async fn applications_of(&self, machine_id: i64) -> Result<Vec<Application>> {
        Ok(self.inner.read().await.applications_of(machine_id))
    }

    async fn endpoints_of(&self, machine_id: i64) -> Result<Vec<ApplicationEndpoint>> {
        Ok(self.inner.read().await.endpoints_of(machine_id))
    }

    async fn clear(&self) -> Result<()> {
        self.inner.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::InventoryStoreExt;

    #[tokio::test]
    async fn test_ensure_host_is_idempotent() {
        let store = MemoryStore::new(Uuid::new_v4());
        let first = store.ensure_host().await.unwrap();
        let second = store.ensure_host().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.agent, Some(store.agent()));
    }

    #[tokio::test]
    async fn test_iterate_machines_is_a_snapshot() {
        let store = MemoryStore::new(Uuid::new_v4());
        store.ensure_host().await.unwrap();
        let mut iter = store.iterate_machines().await.unwrap();
        store
            .put(Machine {
                host_id: "neighbour".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(iter.by_ref().count(), 1);
        iter.restart();
        assert_eq!(iter.count(), 1);
        assert_eq!(store.iterate_machines().await.unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_keys_unique() {
        let store = Arc::new(MemoryStore::new(Uuid::new_v4()));
        let host = store.ensure_host().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let machine_id = host.id;
            handles.push(tokio::spawn(async move {
                store
                    .put(NetworkInterface {
                        machine_id,
                        mac: format!("02:00:00:00:00:{:02x}", i % 4),
                        ..Default::default()
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.nics_of(host.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStore::new(Uuid::new_v4());
        store.ensure_host().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.get_host().await.unwrap().is_none());
    }
}
