//! Run orchestrator
//!
//! One [`Agent::run`] is one invocation: open the store, initialize
//! backends, run the modules, assemble the payload and fan it out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use sitrep_api::Payload;
use sitrep_store::{InventoryStore, StoreKind, open_store};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{BackendFailure, BackendSet};
use crate::config::{
    BACKEND_CONCURRENCY, ConfigRegistry, DB, IGNORE_MISSING_DEPS, NO_MIGRATE, PARALLEL_MODULES,
    STORE,
};
use crate::error::{RunError, SchedulerError};
use crate::payload::assemble;
use crate::registry::{BackendRegistry, ModuleRegistry};
use crate::scheduler::{RunReport, Scheduler, SchedulerOptions};
use crate::supervisor::{NoopSupervisor, Supervisor};

/// Result of a completed run
#[derive(Debug)]
pub struct RunSummary {
    pub payload: Payload,
    pub report: RunReport,
    /// Backends whose `write` failed; the run itself still succeeded
    pub backend_failures: Vec<BackendFailure>,
}

/// Drives one run from sealed registries and resolved configuration
pub struct Agent {
    config: ConfigRegistry,
    modules: ModuleRegistry,
    backends: BackendRegistry,
    agent: Uuid,
    version: String,
    supervisor: Arc<dyn Supervisor>,
    store: Option<Arc<dyn InventoryStore>>,
}

impl Agent {
    #[must_use]
    pub fn new(
        config: ConfigRegistry,
        modules: ModuleRegistry,
        backends: BackendRegistry,
        agent: Uuid,
    ) -> Self {
        Self {
            config,
            modules,
            backends,
            agent,
            version: env!("CARGO_PKG_VERSION").to_string(),
            supervisor: Arc::new(NoopSupervisor),
            store: None,
        }
    }

    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Use an existing store instead of opening the configured one
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn InventoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Execute the run
    ///
    /// A planning failure closes the backends without delivering a payload.
    /// On cancellation the partial payload is still delivered before
    /// `RunError::Cancelled` is returned.
    ///
    /// # Errors
    /// Returns a `RunError` for misconfiguration, store or backend-init
    /// failures, planning failures and cancellation. Module and backend-write
    /// failures are reported in the summary instead.
    #[instrument(skip_all, fields(agent = %self.agent))]
    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let Agent {
            config,
            modules,
            backends,
            agent,
            version,
            supervisor,
            store,
        } = self;

        let options = SchedulerOptions {
            ignore_missing_deps: config.get(IGNORE_MISSING_DEPS)?,
            parallel: config.get(PARALLEL_MODULES)?,
        };
        let concurrency: usize = config.get(BACKEND_CONCURRENCY)?;

        let store = match store {
            Some(store) => store,
            None => open_configured_store(&config, agent).await?,
        };

        let mut backends = BackendSet::new(backends.prepare(&config)?);
        if backends.is_empty() {
            warn!("no backend enabled, the payload will not be delivered anywhere");
        }
        backends.init_all().await?;
        info!(backends = ?backends.names().collect::<Vec<_>>(), "backends initialized");

        let prepared = match modules.prepare(&config, &store) {
            Ok(prepared) => prepared,
            Err(e) => {
                backends.close_all().await;
                return Err(e.into());
            }
        };
        debug!(
            enabled = prepared.enabled.len(),
            disabled = ?prepared.disabled,
            "modules prepared"
        );

        let scheduler = Scheduler::new(prepared.enabled, supervisor, options)
            .with_disabled(prepared.disabled);
        let report = match scheduler.run(Arc::clone(&store), cancel).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "run aborted before any module ran");
                backends.close_all().await;
                return Err(e.into());
            }
        };
        for failure in report.failures() {
            debug!(%failure, "collected module failure");
        }

        let payload = match assemble(
            store.as_ref(),
            &report,
            agent,
            &version,
            started.elapsed(),
        )
        .await
        {
            Ok(payload) => payload,
            Err(e) => {
                backends.close_all().await;
                return Err(e.into());
            }
        };

        let backend_failures = backends.write_all(&payload, concurrency).await;
        backends.close_all().await;

        info!(
            machines = payload.machines.len(),
            module_errors = payload.extra.module_errors.len(),
            backend_failures = backend_failures.len(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "run complete"
        );

        if report.cancelled {
            return Err(SchedulerError::Cancelled.into());
        }
        Ok(RunSummary {
            payload,
            report,
            backend_failures,
        })
    }
}

async fn open_configured_store(
    config: &ConfigRegistry,
    agent: Uuid,
) -> Result<Arc<dyn InventoryStore>, RunError> {
    let kind: StoreKind = config.get::<String>(STORE)?.parse()?;
    let db = config.get::<String>(DB)?;
    let db = (!db.is_empty()).then(|| PathBuf::from(db));
    let migrate = !config.get::<bool>(NO_MIGRATE)?;
    Ok(open_store(kind, db.as_deref(), agent, migrate).await?)
}
