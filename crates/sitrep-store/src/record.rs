//! Storable records and their identity
//!
//! A [`Record`] describes how an inventory entity is keyed: its indexed
//! columns, the column groups that must be unique and the parents it
//! references. Both stores derive their conflict handling from this.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sitrep_api::{
    Application, ApplicationEndpoint, Cpu, Disk, EndpointPolicy, Gpu, Machine, Merge,
    NetworkInterface, NetworkInterfaceSubnet, Package, Subnetwork,
};

/// Value of an indexed column
///
/// `Null` marks an absent identity component; a unique group containing a
/// `Null` never matches another row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Null,
    Int(i64),
    Text(String),
}

impl KeyValue {
    fn text(s: &str) -> Self {
        KeyValue::Text(s.to_string())
    }

    fn text_or_null(s: &str) -> Self {
        if s.is_empty() {
            KeyValue::Null
        } else {
            KeyValue::Text(s.to_string())
        }
    }

    fn id_or_null(id: i64) -> Self {
        if id == 0 { KeyValue::Null } else { KeyValue::Int(id) }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, KeyValue::Null)
    }
}

/// Entity kinds, one per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Machine,
    Cpu,
    Gpu,
    Disk,
    NetworkInterface,
    Subnetwork,
    NetworkInterfaceSubnet,
    Application,
    ApplicationEndpoint,
    EndpointPolicy,
    Package,
}

impl EntityKind {
    /// Tables in dependency order (parents first)
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Machine,
        EntityKind::Cpu,
        EntityKind::Gpu,
        EntityKind::Disk,
        EntityKind::Package,
        EntityKind::NetworkInterface,
        EntityKind::Subnetwork,
        EntityKind::NetworkInterfaceSubnet,
        EntityKind::Application,
        EntityKind::ApplicationEndpoint,
        EntityKind::EndpointPolicy,
    ];

    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Machine => "machines",
            EntityKind::Cpu => "cpus",
            EntityKind::Gpu => "gpus",
            EntityKind::Disk => "disks",
            EntityKind::NetworkInterface => "network_interfaces",
            EntityKind::Subnetwork => "subnetworks",
            EntityKind::NetworkInterfaceSubnet => "network_interface_subnets",
            EntityKind::Application => "applications",
            EntityKind::ApplicationEndpoint => "application_endpoints",
            EntityKind::EndpointPolicy => "endpoint_policies",
            EntityKind::Package => "packages",
        }
    }
}

/// Reference from a record to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRef {
    pub kind: EntityKind,
    pub id: i64,
    /// Whether `id == 0` is a missing parent rather than "no parent"
    pub required: bool,
}

impl ParentRef {
    fn required(kind: EntityKind, id: i64) -> Self {
        Self {
            kind,
            id,
            required: true,
        }
    }

    fn optional(kind: EntityKind, id: i64) -> Self {
        Self {
            kind,
            id,
            required: false,
        }
    }
}

/// Any inventory entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Machine(Machine),
    Cpu(Cpu),
    Gpu(Gpu),
    Disk(Disk),
    NetworkInterface(NetworkInterface),
    Subnetwork(Subnetwork),
    NetworkInterfaceSubnet(NetworkInterfaceSubnet),
    Application(Application),
    ApplicationEndpoint(ApplicationEndpoint),
    EndpointPolicy(EndpointPolicy),
    Package(Package),
}

impl Entity {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Machine(_) => EntityKind::Machine,
            Entity::Cpu(_) => EntityKind::Cpu,
            Entity::Gpu(_) => EntityKind::Gpu,
            Entity::Disk(_) => EntityKind::Disk,
            Entity::NetworkInterface(_) => EntityKind::NetworkInterface,
            Entity::Subnetwork(_) => EntityKind::Subnetwork,
            Entity::NetworkInterfaceSubnet(_) => EntityKind::NetworkInterfaceSubnet,
            Entity::Application(_) => EntityKind::Application,
            Entity::ApplicationEndpoint(_) => EntityKind::ApplicationEndpoint,
            Entity::EndpointPolicy(_) => EntityKind::EndpointPolicy,
            Entity::Package(_) => EntityKind::Package,
        }
    }
}

/// An entity the stores know how to key and persist
pub trait Record: Merge + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn created_at(&self) -> Option<DateTime<Utc>>;
    fn set_timestamps(&mut self, created_at: Option<DateTime<Utc>>, updated_at: Option<DateTime<Utc>>);

    /// Indexed columns, in schema order
    fn columns(&self) -> Vec<(&'static str, KeyValue)>;

    /// Column groups that identify a row
    fn unique_keys() -> &'static [&'static [&'static str]];

    fn parents(&self) -> Vec<ParentRef>;

    fn into_entity(self) -> Entity;
    fn from_entity(entity: Entity) -> Option<Self>;

    /// Values of a unique group, `None` when any component is absent
    fn key_values(&self, group: &[&str]) -> Option<Vec<KeyValue>> {
        let columns = self.columns();
        group
            .iter()
            .map(|name| {
                columns
                    .iter()
                    .find(|(column, _)| column == name)
                    .map(|(_, value)| value.clone())
                    .filter(|value| !value.is_null())
            })
            .collect()
    }
}

macro_rules! record_common {
    ($variant:ident) => {
        const KIND: EntityKind = EntityKind::$variant;

        fn id(&self) -> i64 {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = id;
        }

        fn created_at(&self) -> Option<DateTime<Utc>> {
            self.created_at
        }

        fn set_timestamps(
            &mut self,
            created_at: Option<DateTime<Utc>>,
            updated_at: Option<DateTime<Utc>>,
        ) {
            self.created_at = created_at;
            self.updated_at = updated_at;
        }

        fn into_entity(self) -> Entity {
            Entity::$variant(self)
        }

        fn from_entity(entity: Entity) -> Option<Self> {
            match entity {
                Entity::$variant(record) => Some(record),
                _ => None,
            }
        }
    };
}

macro_rules! entity_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Entity {
                fn from(record: $variant) -> Self {
                    Entity::$variant(record)
                }
            }
        )*
    };
}

entity_from!(
    Machine,
    Cpu,
    Gpu,
    Disk,
    NetworkInterface,
    Subnetwork,
    NetworkInterfaceSubnet,
    Application,
    ApplicationEndpoint,
    EndpointPolicy,
    Package,
);

impl Record for Machine {
    record_common!(Machine);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("host", if self.is_host() { KeyValue::Int(1) } else { KeyValue::Null }),
            ("agent", self.agent.map_or(KeyValue::Null, |a| KeyValue::Text(a.to_string()))),
            ("host_id", KeyValue::text_or_null(&self.host_id)),
            ("parent_machine_id", KeyValue::id_or_null(self.parent_machine_id)),
        ]
    }

    // Any machine carrying an agent id collapses onto the single host row
    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["host"], &["host_id"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![ParentRef::optional(EntityKind::Machine, self.parent_machine_id)]
    }
}

impl Record for Cpu {
    record_common!(Cpu);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("machine_id", KeyValue::Int(self.machine_id)),
            ("model_name", KeyValue::text(&self.model_name)),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["machine_id", "model_name"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![ParentRef::required(EntityKind::Machine, self.machine_id)]
    }
}

impl Record for Gpu {
    record_common!(Gpu);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("machine_id", KeyValue::Int(self.machine_id)),
            ("gpu_index", KeyValue::Int(i64::from(self.index))),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["machine_id", "gpu_index"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![ParentRef::required(EntityKind::Machine, self.machine_id)]
    }
}

impl Record for Disk {
    record_common!(Disk);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("machine_id", KeyValue::Int(self.machine_id)),
            ("name", KeyValue::text_or_null(&self.name)),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["machine_id", "name"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![ParentRef::required(EntityKind::Machine, self.machine_id)]
    }
}

impl Record for NetworkInterface {
    record_common!(NetworkInterface);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("machine_id", KeyValue::Int(self.machine_id)),
            ("mac", KeyValue::text_or_null(&self.mac)),
            ("name", KeyValue::text_or_null(&self.name)),
            ("tag", KeyValue::text(&self.tag)),
        ]
    }

    // Interfaces without a hardware address (tunnels) fall back to their name
    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["machine_id", "mac", "tag"], &["machine_id", "name", "tag"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![ParentRef::required(EntityKind::Machine, self.machine_id)]
    }
}

impl Record for Subnetwork {
    record_common!(Subnetwork);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("cidr", KeyValue::text_or_null(&self.cidr)),
            ("tag", KeyValue::text(&self.tag)),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["cidr", "tag"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        Vec::new()
    }
}

impl Record for NetworkInterfaceSubnet {
    record_common!(NetworkInterfaceSubnet);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("nic_id", KeyValue::Int(self.nic_id)),
            ("subnet_id", KeyValue::Int(self.subnet_id)),
            ("mac_subnet", KeyValue::text_or_null(&self.mac_subnet)),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["mac_subnet"], &["nic_id", "subnet_id"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![
            ParentRef::required(EntityKind::NetworkInterface, self.nic_id),
            ParentRef::required(EntityKind::Subnetwork, self.subnet_id),
        ]
    }
}

impl Record for Application {
    record_common!(Application);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("machine_id", KeyValue::Int(self.machine_id)),
            ("name", KeyValue::text_or_null(&self.name)),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["machine_id", "name"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![ParentRef::required(EntityKind::Machine, self.machine_id)]
    }
}

impl Record for ApplicationEndpoint {
    record_common!(ApplicationEndpoint);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("application_id", KeyValue::id_or_null(self.application_id)),
            ("nic_id", KeyValue::Int(self.nic_id)),
            ("addr", KeyValue::Text(self.addr.to_string())),
            ("port", KeyValue::Int(i64::from(self.port))),
            ("protocol", KeyValue::text(self.protocol.as_str())),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["nic_id", "addr", "port", "protocol"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![
            ParentRef::required(EntityKind::NetworkInterface, self.nic_id),
            ParentRef::optional(EntityKind::Application, self.application_id),
        ]
    }
}

impl Record for EndpointPolicy {
    record_common!(EndpointPolicy);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("endpoint_id", KeyValue::Int(self.endpoint_id)),
            ("action", KeyValue::text(self.action.as_str())),
            ("src_endpoint_id", KeyValue::Int(self.src_endpoint_id)),
            (
                "src_addr",
                KeyValue::Text(self.src_addr.map(|a| a.to_string()).unwrap_or_default()),
            ),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["endpoint_id", "action", "src_endpoint_id", "src_addr"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![
            ParentRef::required(EntityKind::ApplicationEndpoint, self.endpoint_id),
            ParentRef::optional(EntityKind::ApplicationEndpoint, self.src_endpoint_id),
        ]
    }
}

impl Record for Package {
    record_common!(Package);

    fn columns(&self) -> Vec<(&'static str, KeyValue)> {
        vec![
            ("machine_id", KeyValue::Int(self.machine_id)),
            ("name", KeyValue::text_or_null(&self.name)),
            ("version", KeyValue::text(&self.version)),
            ("manager", KeyValue::text(&self.manager)),
        ]
    }

    fn unique_keys() -> &'static [&'static [&'static str]] {
        &[&["machine_id", "name", "version", "manager"]]
    }

    fn parents(&self) -> Vec<ParentRef> {
        vec![ParentRef::required(EntityKind::Machine, self.machine_id)]
    }
}
