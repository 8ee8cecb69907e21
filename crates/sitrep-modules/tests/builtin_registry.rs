//! The built-in collector set as the engine sees it

use std::sync::Arc;

use sitrep_core::{
    ConfigRegistry, ModuleRegistry, NoopSupervisor, RegistryError, Scheduler, SchedulerOptions,
    define_core_keys,
};
use sitrep_exec::LocalExecutor;
use sitrep_modules::{HostFs, register_builtin_with};
use sitrep_store::{InventoryStore, MemoryStore};
use uuid::Uuid;

fn sealed(config: &mut ConfigRegistry) -> ModuleRegistry {
    let mut builder = ModuleRegistry::builder();
    register_builtin_with(&mut builder, Arc::new(LocalExecutor::new()), &HostFs::at("/nonexistent"))
        .unwrap();
    builder.seal(config).unwrap()
}

#[test]
fn test_builtin_names_and_options() {
    let mut config = ConfigRegistry::new();
    define_core_keys(&mut config).unwrap();
    let registry = sealed(&mut config);

    let names: Vec<_> = registry.names().collect();
    for name in [
        "arp",
        "chassis",
        "docker",
        "dpkg",
        "host-basic",
        "host-cpu",
        "host-disk",
        "host-gpu",
        "host-network",
        "netstat",
        "ping",
        "rpm",
        "standard-protocol",
        "tcp-scan",
    ] {
        assert!(names.contains(&name), "{name} not registered");
        assert!(config.contains(&format!("no-module-{name}")));
    }
    assert!(config.contains("tcp-scan.ports"));
    assert!(config.contains("dpkg.admin-dir"));
    assert!(config.contains("ping.workers"));
    assert!(registry.capabilities("ping").unwrap().configurable);
    assert!(registry.capabilities("tcp-scan").unwrap().log_producer);
}

#[test]
fn test_registering_twice_is_rejected() {
    let mut builder = ModuleRegistry::builder();
    let fs = HostFs::at("/nonexistent");
    register_builtin_with(&mut builder, Arc::new(LocalExecutor::new()), &fs).unwrap();
    let err = register_builtin_with(&mut builder, Arc::new(LocalExecutor::new()), &fs).unwrap_err();
    assert!(matches!(err, RegistryError::Duplicate { .. }));
}

#[test]
fn test_builtin_plan_respects_dependencies() {
    let mut config = ConfigRegistry::new();
    define_core_keys(&mut config).unwrap();
    let registry = sealed(&mut config);
    let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new(Uuid::new_v4()));
    let prepared = registry.prepare(&config, &store).unwrap();

    let plan = Scheduler::new(
        prepared.enabled,
        Arc::new(NoopSupervisor),
        SchedulerOptions::default(),
    )
    .plan()
    .unwrap();

    let pos = |name: &str| plan.order.iter().position(|n| n == name).unwrap();
    assert_eq!(plan.order.len(), 14);
    assert_eq!(pos("host-basic"), 0);
    assert!(pos("host-network") < pos("ping"));
    assert!(pos("ping") < pos("arp"));
    assert!(pos("host-network") < pos("docker"));
    assert!(pos("arp") < pos("tcp-scan"));
    assert!(pos("netstat") < pos("standard-protocol"));
    assert!(pos("tcp-scan") < pos("standard-protocol"));
    assert_eq!(plan.layers[0], vec!["host-basic".to_string()]);
}

#[test]
fn test_disabling_arp_strands_the_scanners() {
    let mut config = ConfigRegistry::new();
    define_core_keys(&mut config).unwrap();
    let registry = sealed(&mut config);
    config.set("no-module-arp", true).unwrap();
    config.set("ignore-missing-deps", true).unwrap();
    let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new(Uuid::new_v4()));
    let prepared = registry.prepare(&config, &store).unwrap();
    assert_eq!(prepared.disabled, vec!["arp".to_string()]);

    let plan = Scheduler::new(
        prepared.enabled,
        Arc::new(NoopSupervisor),
        SchedulerOptions {
            ignore_missing_deps: true,
            parallel: false,
        },
    )
    .with_disabled(prepared.disabled)
    .plan()
    .unwrap();
    assert!(plan.skipped.contains(&"tcp-scan".to_string()));
    assert!(plan.skipped.contains(&"standard-protocol".to_string()));
    assert!(!plan.order.contains(&"tcp-scan".to_string()));
    assert!(plan.order.contains(&"netstat".to_string()));
}
