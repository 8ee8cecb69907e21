//! Module and backend registries
//!
//! Registration happens once at startup through a builder; sealing validates
//! the set, binds configuration keys and freezes it. Sealed registries are
//! passed explicitly into the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use sitrep_store::InventoryStore;
use tracing::{debug, info, info_span};

use crate::backend::Backend;
use crate::config::ConfigRegistry;
use crate::error::{ConfigError, RegistryError};
use crate::module::{Capabilities, Module};

/// Config key disabling a module
#[must_use]
pub fn disable_key(module: &str) -> String {
    format!("no-module-{module}")
}

/// Config key enabling a backend
#[must_use]
pub fn enable_key(backend: &str) -> String {
    format!("enable-backend-{backend}")
}

// ============================================================================
// Modules
// ============================================================================

struct ModuleEntry {
    module: Box<dyn Module>,
    capabilities: Capabilities,
}

/// Collects modules before sealing
#[derive(Default)]
pub struct ModuleRegistryBuilder {
    entries: BTreeMap<&'static str, ModuleEntry>,
}

impl ModuleRegistryBuilder {
    /// Add a module
    ///
    /// # Errors
    /// Returns `Duplicate` if a module with the same name exists.
    pub fn register(&mut self, mut module: Box<dyn Module>) -> Result<&mut Self, RegistryError> {
        let name = module.name();
        if self.entries.contains_key(name) {
            return Err(RegistryError::Duplicate {
                kind: "module",
                name: name.to_string(),
            });
        }
        let capabilities = Capabilities::of_module(module.as_mut());
        debug!(module = name, ?capabilities, "module registered");
        self.entries.insert(
            name,
            ModuleEntry {
                module,
                capabilities,
            },
        );
        Ok(self)
    }

    /// Validate references and bind every module's configuration
    ///
    /// # Errors
    /// Returns `UnknownDependency` for a dependency that was never registered,
    /// or `Config` if binding a key fails.
    pub fn seal(self, config: &mut ConfigRegistry) -> Result<ModuleRegistry, RegistryError> {
        for (name, entry) in &self.entries {
            if let Some(missing) = entry
                .module
                .dependencies()
                .iter()
                .find(|dep| !self.entries.contains_key(**dep))
            {
                return Err(RegistryError::UnknownDependency {
                    module: (*name).to_string(),
                    dependency: (*missing).to_string(),
                });
            }
        }

        let mut entries = self.entries;
        for (name, entry) in &mut entries {
            config.define(
                disable_key(name),
                false,
                format!("Disable the {name} module"),
            )?;
            if let Some(configurable) = entry.module.as_configurable() {
                configurable.bind(config)?;
            }
        }
        info!(modules = entries.len(), "module registry sealed");
        Ok(ModuleRegistry { entries })
    }
}

/// Read-only set of modules, enumerated by name
pub struct ModuleRegistry {
    entries: BTreeMap<&'static str, ModuleEntry>,
}

/// Modules ready for one run
pub struct PreparedModules {
    pub enabled: Vec<Arc<dyn Module>>,
    /// Disabled through `no-module-<name>`
    pub disabled: Vec<String>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder::default()
    }

    /// Registered names in lexicographic order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capabilities(&self, name: &str) -> Option<Capabilities> {
        self.entries.get(name).map(|e| e.capabilities)
    }

    #[must_use]
    pub fn dependencies(&self, name: &str) -> Option<&'static [&'static str]> {
        self.entries.get(name).map(|e| e.module.dependencies())
    }

    /// Drop disabled modules and hand configuration, logger and store to the rest
    ///
    /// # Errors
    /// Returns a `ConfigError` when a module cannot read its options.
    pub fn prepare(
        self,
        config: &ConfigRegistry,
        store: &Arc<dyn InventoryStore>,
    ) -> Result<PreparedModules, ConfigError> {
        let mut enabled: Vec<Arc<dyn Module>> = Vec::new();
        let mut disabled = Vec::new();

        for (name, entry) in self.entries {
            if config.get::<bool>(&disable_key(name))? {
                debug!(module = name, "module disabled");
                disabled.push(name.to_string());
                continue;
            }
            let mut module = entry.module;
            if let Some(configurable) = module.as_configurable() {
                configurable.configure(config)?;
            }
            if let Some(producer) = module.as_log_producer() {
                producer.set_logger(info_span!("module", name));
            }
            if let Some(demander) = module.as_storage_demander() {
                demander.set_store(Arc::clone(store));
            }
            enabled.push(Arc::from(module));
        }

        Ok(PreparedModules { enabled, disabled })
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Collects backends before sealing
#[derive(Default)]
pub struct BackendRegistryBuilder {
    entries: BTreeMap<&'static str, Box<dyn Backend>>,
}

impl BackendRegistryBuilder {
    /// Add a backend
    ///
    /// # Errors
    /// Returns `Duplicate` if a backend with the same name exists.
    pub fn register(&mut self, backend: Box<dyn Backend>) -> Result<&mut Self, RegistryError> {
        let name = backend.name();
        if self.entries.contains_key(name) {
            return Err(RegistryError::Duplicate {
                kind: "backend",
                name: name.to_string(),
            });
        }
        self.entries.insert(name, backend);
        Ok(self)
    }

    /// Bind `enable-backend-<name>` and each backend's options
    ///
    /// # Errors
    /// Returns `Config` if binding a key fails.
    pub fn seal(self, config: &mut ConfigRegistry) -> Result<BackendRegistry, RegistryError> {
        let mut entries = self.entries;
        for (name, backend) in &mut entries {
            config.define(
                enable_key(name),
                false,
                format!("Enable the {name} backend"),
            )?;
            if let Some(configurable) = backend.as_configurable() {
                configurable.bind(config)?;
            }
        }
        Ok(BackendRegistry { entries })
    }
}

/// Read-only set of backends
pub struct BackendRegistry {
    entries: BTreeMap<&'static str, Box<dyn Backend>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn builder() -> BackendRegistryBuilder {
        BackendRegistryBuilder::default()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep enabled backends, configured and with their logger set
    ///
    /// # Errors
    /// Returns a `ConfigError` when a backend cannot read its options.
    pub fn prepare(self, config: &ConfigRegistry) -> Result<Vec<Box<dyn Backend>>, ConfigError> {
        let mut enabled = Vec::new();
        for (name, mut backend) in self.entries {
            if !config.get::<bool>(&enable_key(name))? {
                continue;
            }
            if let Some(configurable) = backend.as_configurable() {
                configurable.configure(config)?;
            }
            if let Some(producer) = backend.as_log_producer() {
                producer.set_logger(info_span!("backend", name));
            }
            enabled.push(backend);
        }
        Ok(enabled)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use sitrep_store::{InventoryStoreExt, MemoryStore};
    use uuid::Uuid;

    use super::*;
    use crate::error::ModuleError;
    use crate::module::{Configurable, ModuleContext, StorageDemander};

    struct Named {
        name: &'static str,
        deps: &'static [&'static str],
    }

    #[async_trait]
    impl Module for Named {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }

        async fn run(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct WithOption {
        ports: Vec<String>,
    }

    #[async_trait]
    impl Module for WithOption {
        fn name(&self) -> &'static str {
            "scan"
        }

        async fn run(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }

        fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
            Some(self)
        }
    }

    impl Configurable for WithOption {
        fn bind(&self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
            config.define("scan.ports", &["22"][..], "ports")
        }

        fn configure(&mut self, config: &ConfigRegistry) -> Result<(), ConfigError> {
            self.ports = config.get("scan.ports")?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Keeper {
        store: Option<Arc<dyn InventoryStore>>,
    }

    #[async_trait]
    impl Module for Keeper {
        fn name(&self) -> &'static str {
            "keeper"
        }

        async fn run(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            let store = self
                .store
                .as_ref()
                .ok_or_else(|| ModuleError::msg("store handle not set"))?;
            store.ensure_host().await?;
            Ok(())
        }

        fn as_storage_demander(&mut self) -> Option<&mut dyn StorageDemander> {
            Some(self)
        }
    }

    impl StorageDemander for Keeper {
        fn set_store(&mut self, store: Arc<dyn InventoryStore>) {
            self.store = Some(store);
        }
    }

    #[test]
    fn test_duplicate_module() {
        let mut builder = ModuleRegistry::builder();
        builder
            .register(Box::new(Named { name: "a", deps: &[] }))
            .unwrap();
        let err = builder
            .register(Box::new(Named { name: "a", deps: &[] }))
            .err()
            .unwrap();
        assert_eq!(
            err,
            RegistryError::Duplicate {
                kind: "module",
                name: "a".into()
            }
        );
    }

    #[test]
    fn test_unknown_dependency_on_seal() {
        let mut builder = ModuleRegistry::builder();
        builder
            .register(Box::new(Named { name: "a", deps: &["ghost"] }))
            .unwrap();
        let err = builder.seal(&mut ConfigRegistry::new()).err().unwrap();
        assert_eq!(
            err,
            RegistryError::UnknownDependency {
                module: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_sealed_registry_is_ordered_and_bound() {
        let mut builder = ModuleRegistry::builder();
        builder
            .register(Box::new(Named { name: "zeta", deps: &[] }))
            .unwrap()
            .register(Box::new(WithOption::default()))
            .unwrap()
            .register(Box::new(Named { name: "alpha", deps: &["zeta"] }))
            .unwrap();
        let mut config = ConfigRegistry::new();
        let registry = builder.seal(&mut config).unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), ["alpha", "scan", "zeta"]);
        assert!(config.contains("no-module-alpha"));
        assert!(config.contains("scan.ports"));
        assert!(registry.capabilities("scan").unwrap().configurable);
        assert!(!registry.capabilities("alpha").unwrap().configurable);
    }

    #[test]
    fn test_prepare_filters_disabled() {
        let mut builder = ModuleRegistry::builder();
        builder
            .register(Box::new(Named { name: "a", deps: &[] }))
            .unwrap()
            .register(Box::new(Named { name: "b", deps: &[] }))
            .unwrap();
        let mut config = ConfigRegistry::new();
        let registry = builder.seal(&mut config).unwrap();
        config.set("no-module-b", true).unwrap();

        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new(Uuid::new_v4()));
        let prepared = registry.prepare(&config, &store).unwrap();
        let names: Vec<_> = prepared.enabled.iter().map(|m| m.name()).collect();
        assert_eq!(names, ["a"]);
        assert_eq!(prepared.disabled, ["b"]);
    }

    #[tokio::test]
    async fn test_prepare_hands_store_to_demanders() {
        let mut builder = ModuleRegistry::builder();
        builder.register(Box::new(Keeper::default())).unwrap();
        let mut config = ConfigRegistry::new();
        let registry = builder.seal(&mut config).unwrap();
        assert!(registry.capabilities("keeper").unwrap().storage_demander);

        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new(Uuid::new_v4()));
        let prepared = registry.prepare(&config, &store).unwrap();

        let other: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new(Uuid::new_v4()));
        let ctx = ModuleContext::new(
            tokio_util::sync::CancellationToken::new(),
            other,
            tracing::Span::none(),
        );
        prepared.enabled[0].run(&ctx).await.unwrap();
        assert!(store.get_host().await.unwrap().is_some());
    }
}
