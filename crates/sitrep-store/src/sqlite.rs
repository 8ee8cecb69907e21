//! SQLite-backed inventory store
//!
//! One table per entity kind: the unique key columns are real columns with
//! UNIQUE constraints and foreign keys, the full record is kept as JSON in
//! `data`. Lookups are keyed queries against those columns; only the full
//! payload snapshot rehydrates an [`Inventory`].

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sitrep_api::{
    Application, ApplicationEndpoint, Cpu, Disk, EndpointPolicy, Gpu, Machine, NetworkInterface,
    NetworkInterfaceSubnet, Package, Payload, Protocol, Subnetwork,
};
use sqlx::migrate::Migrator;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::inventory::Inventory;
use crate::record::{Entity, EntityKind, KeyValue, Record};
use crate::store::{InventoryStore, Listener, MachineIter, MachineLookup, OnConflict};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Persistent store for longitudinal inventory
pub struct SqliteStore {
    agent: Uuid,
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    #[instrument(skip(agent))]
    pub async fn open(path: &Path, agent: Uuid) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        Self::connect(options, agent).await
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    /// Returns an error if SQLite cannot be initialized.
    pub async fn open_in_memory(agent: Uuid) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect(options, agent).await
    }

    // A single long-lived connection serializes writers and keeps in-memory
    // databases alive.
    async fn connect(options: SqliteConnectOptions, agent: Uuid) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { agent, pool })
    }

    /// Apply pending migrations
    ///
    /// # Errors
    /// Returns an error if a migration fails.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrated");
        Ok(())
    }

    /// Revert migrations newer than `target`
    ///
    /// # Errors
    /// Returns an error if a down migration fails.
    #[instrument(skip(self))]
    pub async fn rollback(&self, target: i64) -> Result<()> {
        MIGRATOR.undo(&self.pool, target).await?;
        info!(target, "database rolled back");
        Ok(())
    }

    /// Read every table into an [`Inventory`]
    ///
    /// # Errors
    /// Returns an error if a query fails or a row cannot be decoded.
    pub async fn load(&self) -> Result<Inventory> {
        let mut conn = self.pool.acquire().await?;
        let mut inventory = Inventory::new();
        load_table::<Machine>(&mut conn, &mut inventory).await?;
        load_table::<Cpu>(&mut conn, &mut inventory).await?;
        load_table::<Gpu>(&mut conn, &mut inventory).await?;
        load_table::<Disk>(&mut conn, &mut inventory).await?;
        load_table::<Package>(&mut conn, &mut inventory).await?;
        load_table::<NetworkInterface>(&mut conn, &mut inventory).await?;
        load_table::<Subnetwork>(&mut conn, &mut inventory).await?;
        load_table::<NetworkInterfaceSubnet>(&mut conn, &mut inventory).await?;
        load_table::<Application>(&mut conn, &mut inventory).await?;
        load_table::<ApplicationEndpoint>(&mut conn, &mut inventory).await?;
        load_table::<EndpointPolicy>(&mut conn, &mut inventory).await?;
        Ok(inventory)
    }

    async fn upsert_record<R: Record>(&self, record: R, on_conflict: OnConflict) -> Result<R> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let explicit = record.id() != 0;
        let existing = if explicit {
            let stored = fetch_by_id::<R>(&mut tx, record.id()).await?;
            Some(stored.ok_or(StoreError::NotFound {
                kind: R::KIND,
                id: record.id(),
            })?)
        } else {
            fetch_by_keys(&mut tx, &record).await?
        };

        for parent in record.parents() {
            let dangling = if parent.id == 0 {
                parent.required
            } else {
                !row_exists(&mut tx, parent.kind, parent.id).await?
            };
            if dangling {
                return Err(StoreError::MissingParent {
                    kind: R::KIND,
                    parent: parent.kind,
                    id: parent.id,
                });
            }
        }

        let stored = match existing {
            None => insert(&mut tx, record, now).await?,
            Some(stored) => match on_conflict {
                OnConflict::DoNothing if !explicit => stored,
                OnConflict::Fail if !explicit => {
                    return Err(StoreError::UniqueViolation {
                        kind: R::KIND,
                        detail: format!("conflicts with #{}", stored.id()),
                    });
                }
                _ => {
                    let mut merged = stored;
                    merged.merge(record);
                    update(&mut tx, merged, now).await?
                }
            },
        };

        tx.commit().await?;
        Ok(stored)
    }
}

#[async_trait]
impl InventoryStore for SqliteStore {
    fn agent(&self) -> Uuid {
        self.agent
    }

    #[instrument(skip(self, entity), fields(kind = ?entity.kind()))]
    async fn upsert(&self, entity: Entity, on_conflict: OnConflict) -> Result<Entity> {
        let stored = match entity {
            Entity::Machine(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
            Entity::Cpu(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
            Entity::Gpu(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
            Entity::Disk(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
            Entity::NetworkInterface(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
            Entity::Subnetwork(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
            Entity::NetworkInterfaceSubnet(r) => {
                self.upsert_record(r, on_conflict).await?.into_entity()
            }
            Entity::Application(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
            Entity::ApplicationEndpoint(r) => {
                self.upsert_record(r, on_conflict).await?.into_entity()
            }
            Entity::EndpointPolicy(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
            Entity::Package(r) => self.upsert_record(r, on_conflict).await?.into_entity(),
        };
        debug!("upserted");
        Ok(stored)
    }

    async fn get_host(&self) -> Result<Option<Machine>> {
        let mut conn = self.pool.acquire().await?;
        Ok(select_where::<Machine>(&mut conn, "host = 1", []).await?.pop())
    }

    async fn find_machine_by(&self, lookup: MachineLookup) -> Result<Option<Machine>> {
        let mut conn = self.pool.acquire().await?;
        let (predicate, binds) = match lookup {
            MachineLookup::HostId(host_id) => {
                if host_id.is_empty() {
                    return Ok(None);
                }
                let found =
                    select_where::<Machine>(&mut conn, "host_id = ?", [KeyValue::Text(host_id)])
                        .await?;
                return Ok(found.into_iter().next());
            }
            MachineLookup::Mac(mac) => {
                if mac.is_empty() {
                    return Ok(None);
                }
                ("n.mac = ? COLLATE NOCASE", vec![KeyValue::Text(mac)])
            }
            MachineLookup::Ip(ip) => {
                if ip.is_unspecified() {
                    return Ok(None);
                }
                (
                    "n.id IN (SELECT n2.id FROM network_interfaces n2, json_each(n2.data, '$.ips') ip \
                     WHERE ip.value = ?)",
                    vec![KeyValue::Text(ip.to_string())],
                )
            }
            MachineLookup::IpMac(ip, mac) => {
                if ip.is_unspecified() || mac.is_empty() {
                    return Ok(None);
                }
                (
                    "n.mac = ? COLLATE NOCASE AND n.id IN (SELECT n2.id FROM network_interfaces n2, \
                     json_each(n2.data, '$.ips') ip WHERE ip.value = ?)",
                    vec![KeyValue::Text(mac), KeyValue::Text(ip.to_string())],
                )
            }
        };
        let sql = format!(
            "SELECT m.id, m.data, m.created_at, m.updated_at FROM network_interfaces n \
             JOIN machines m ON m.id = n.machine_id WHERE {predicate} ORDER BY n.id LIMIT 1"
        );
        Ok(select::<Machine>(&mut conn, &sql, binds).await?.pop())
    }

    async fn find_listeners(&self, port: u16, protocol: Protocol) -> Result<Vec<Listener>> {
        let mut conn = self.pool.acquire().await?;
        let endpoints = select_where::<ApplicationEndpoint>(
            &mut conn,
            "port = ? AND protocol = ?",
            [
                KeyValue::Int(i64::from(port)),
                KeyValue::Text(protocol.as_str().to_string()),
            ],
        )
        .await?;

        let mut listeners = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let Some(nic) = fetch_by_id::<NetworkInterface>(&mut conn, endpoint.nic_id).await? else {
                continue;
            };
            let Some(machine) = fetch_by_id::<Machine>(&mut conn, nic.machine_id).await? else {
                continue;
            };
            let application = if endpoint.application_id == 0 {
                None
            } else {
                fetch_by_id::<Application>(&mut conn, endpoint.application_id).await?
            };
            listeners.push(Listener {
                machine,
                application,
                endpoint,
            });
        }
        Ok(listeners)
    }

    async fn iterate_machines(&self) -> Result<MachineIter> {
        let mut conn = self.pool.acquire().await?;
        let machines = select_where::<Machine>(&mut conn, "1 = 1", []).await?;
        Ok(MachineIter::new(machines))
    }

    async fn snapshot_payload(&self) -> Result<Payload> {
        Ok(self.load().await?.payload())
    }

    async fn nics_of(&self, machine_id: i64) -> Result<Vec<NetworkInterface>> {
        let mut conn = self.pool.acquire().await?;
        select_where(&mut conn, "machine_id = ?", [KeyValue::Int(machine_id)]).await
    }

    async fn subnetworks(&self) -> Result<Vec<Subnetwork>> {
        let mut conn = self.pool.acquire().await?;
        select_where(&mut conn, "1 = 1", []).await
    }

    async fn all_ipv4_networks(&self) -> Result<Vec<Subnetwork>> {
        let mut conn = self.pool.acquire().await?;
        select_where(&mut conn, "json_extract(data, '$.ip_version') = 4", []).await
    }

    async fn applications_of(&self, machine_id: i64) -> Result<Vec<Application>> {
        let mut conn = self.pool.acquire().await?;
        select_where(&mut conn, "machine_id = ?", [KeyValue::Int(machine_id)]).await
    }

    async fn endpoints_of(&self, machine_id: i64) -> Result<Vec<ApplicationEndpoint>> {
        let mut conn = self.pool.acquire().await?;
        select(
            &mut conn,
            "SELECT e.id, e.data, e.created_at, e.updated_at FROM application_endpoints e \
             JOIN network_interfaces n ON n.id = e.nic_id WHERE n.machine_id = ? ORDER BY e.id",
            [KeyValue::Int(machine_id)],
        )
        .await
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for kind in EntityKind::ALL.iter().rev() {
            sqlx::query(&format!("DELETE FROM {}", kind.table()))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Row helpers
// ============================================================================

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_key(query: SqliteQuery<'_>, value: KeyValue) -> SqliteQuery<'_> {
    match value {
        KeyValue::Null => query.bind(None::<i64>),
        KeyValue::Int(i) => query.bind(i),
        KeyValue::Text(s) => query.bind(s),
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn decode_row<R: Record>(row: &SqliteRow) -> Result<R> {
    let table = R::KIND.table();
    let id: i64 = row.try_get("id")?;
    let data: String = row.try_get("data")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let mut record: R = serde_json::from_str(&data).map_err(|e| StoreError::Corrupt {
        table,
        message: e.to_string(),
    })?;
    record.set_id(id);
    record.set_timestamps(parse_timestamp(&created_at), parse_timestamp(&updated_at));
    Ok(record)
}

fn encode_data<R: Record>(record: &R) -> Result<String> {
    serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
        table: R::KIND.table(),
        message: e.to_string(),
    })
}

fn map_write_error(kind: EntityKind, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::UniqueViolation {
            kind,
            detail: db.message().to_string(),
        },
        other => StoreError::Database(other),
    }
}

async fn load_table<R: Record>(conn: &mut SqliteConnection, inventory: &mut Inventory) -> Result<()> {
    let sql = format!(
        "SELECT id, data, created_at, updated_at FROM {} ORDER BY id",
        R::KIND.table()
    );
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    for row in &rows {
        inventory.restore(decode_row::<R>(row)?.into_entity());
    }
    Ok(())
}

async fn select<R: Record>(
    conn: &mut SqliteConnection,
    sql: &str,
    binds: impl IntoIterator<Item = KeyValue>,
) -> Result<Vec<R>> {
    let mut query = sqlx::query(sql);
    for value in binds {
        query = bind_key(query, value);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(decode_row::<R>).collect()
}

async fn select_where<R: Record>(
    conn: &mut SqliteConnection,
    predicate: &str,
    binds: impl IntoIterator<Item = KeyValue>,
) -> Result<Vec<R>> {
    let sql = format!(
        "SELECT id, data, created_at, updated_at FROM {} WHERE {predicate} ORDER BY id",
        R::KIND.table()
    );
    select(conn, &sql, binds).await
}

async fn fetch_by_id<R: Record>(conn: &mut SqliteConnection, id: i64) -> Result<Option<R>> {
    let sql = format!(
        "SELECT id, data, created_at, updated_at FROM {} WHERE id = ?",
        R::KIND.table()
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(decode_row::<R>).transpose()
}

async fn fetch_by_keys<R: Record>(conn: &mut SqliteConnection, record: &R) -> Result<Option<R>> {
    for group in R::unique_keys() {
        let Some(values) = record.key_values(group) else {
            continue;
        };
        let predicate = group
            .iter()
            .map(|column| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT id, data, created_at, updated_at FROM {} WHERE {predicate} LIMIT 1",
            R::KIND.table()
        );
        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_key(query, value);
        }
        if let Some(row) = query.fetch_optional(&mut *conn).await? {
            return decode_row(&row).map(Some);
        }
    }
    Ok(None)
}

async fn row_exists(conn: &mut SqliteConnection, kind: EntityKind, id: i64) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", kind.table());
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(row.is_some())
}

async fn insert<R: Record>(conn: &mut SqliteConnection, mut record: R, now: DateTime<Utc>) -> Result<R> {
    let columns = record.columns();
    let names = columns
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len() + 3].join(", ");
    let sql = format!(
        "INSERT INTO {} ({names}, data, created_at, updated_at) VALUES ({placeholders})",
        R::KIND.table()
    );

    record.set_timestamps(Some(now), Some(now));
    let data = encode_data(&record)?;
    let mut query = sqlx::query(&sql);
    for (_, value) in columns {
        query = bind_key(query, value);
    }
    let result = query
        .bind(data)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_write_error(R::KIND, e))?;

    record.set_id(result.last_insert_rowid());
    Ok(record)
}

async fn update<R: Record>(conn: &mut SqliteConnection, mut record: R, now: DateTime<Utc>) -> Result<R> {
    let columns = record.columns();
    let assignments = columns
        .iter()
        .map(|(name, _)| format!("{name} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {assignments}, data = ?, updated_at = ? WHERE id = ?",
        R::KIND.table()
    );

    let created_at = record.created_at();
    record.set_timestamps(created_at, Some(now));
    let data = encode_data(&record)?;
    let mut query = sqlx::query(&sql);
    for (_, value) in columns {
        query = bind_key(query, value);
    }
    query
        .bind(data)
        .bind(now.to_rfc3339())
        .bind(record.id())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_write_error(R::KIND, e))?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InventoryStoreExt;

    async fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory(Uuid::new_v4()).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_upsert_merges_by_key() {
        let store = store().await;
        let host = store.ensure_host().await.unwrap();
        let again = store
            .put(Machine {
                agent: Some(store.agent()),
                hostname: "box".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(host.id, again.id);
        assert_eq!(again.hostname, "box");
        assert_eq!(store.iterate_machines().await.unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_uniqueness() {
        let store = store().await;
        let host = store.ensure_host().await.unwrap();
        let nic = store
            .put(NetworkInterface {
                machine_id: host.id,
                name: "eth0".to_string(),
                mac: "02:00:00:00:00:01".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let endpoint = ApplicationEndpoint {
            nic_id: nic.id,
            addr: "10.0.0.2".parse().unwrap(),
            port: 443,
            ..Default::default()
        };
        let first = store.put(endpoint.clone()).await.unwrap();
        let second = store
            .put(ApplicationEndpoint {
                application_protocols: vec!["https".to_string()],
                ..endpoint.clone()
            })
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.application_protocols, vec!["https".to_string()]);

        let err = store
            .upsert(endpoint.into(), OnConflict::Fail)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let listeners = store.find_tcp_listeners(443).await.unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].machine.id, host.id);
    }

    #[tokio::test]
    async fn test_missing_parent() {
        let store = store().await;
        let err = store
            .put(Cpu {
                machine_id: 99,
                model_name: "x".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingParent { id: 99, .. }));
    }

    #[tokio::test]
    async fn test_rollback_drops_tables() {
        let store = store().await;
        store.ensure_host().await.unwrap();
        store.rollback(0).await.unwrap();
        assert!(store.get_host().await.is_err());
        store.migrate().await.unwrap();
        assert!(store.get_host().await.unwrap().is_none());
    }
}
