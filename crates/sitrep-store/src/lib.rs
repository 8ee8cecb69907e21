//! sitrep-store: the inventory store
//!
//! Provides the [`InventoryStore`] contract shared by every collector module,
//! with an in-memory variant for one-shot runs and an SQLite variant for
//! longitudinal inventory.

pub mod error;
pub mod inventory;
pub mod memory;
pub mod record;
pub mod sqlite;
pub mod store;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

pub use error::{Result, StoreError};
pub use inventory::Inventory;
pub use memory::MemoryStore;
pub use record::{Entity, EntityKind, KeyValue, Record};
pub use sqlite::SqliteStore;
pub use store::{
    InventoryStore, InventoryStoreExt, Listener, MachineIter, MachineLookup, OnConflict,
};

/// Store variant selected by configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "" => Ok(StoreKind::Memory),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(StoreError::Config(format!("unknown store: {other}"))),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Memory => f.write_str("memory"),
            StoreKind::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Construct the configured store
///
/// The SQLite variant migrates before returning unless `migrate` is false.
///
/// # Errors
/// Returns an error if the database cannot be opened or migrated.
pub async fn open_store(
    kind: StoreKind,
    db: Option<&Path>,
    agent: Uuid,
    migrate: bool,
) -> Result<Arc<dyn InventoryStore>> {
    match kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new(agent))),
        StoreKind::Sqlite => {
            let store = match db {
                Some(path) => SqliteStore::open(path, agent).await?,
                None => SqliteStore::open_in_memory(agent).await?,
            };
            if migrate {
                store.migrate().await?;
            }
            info!(store = %kind, "inventory store ready");
            Ok(Arc::new(store))
        }
    }
}
