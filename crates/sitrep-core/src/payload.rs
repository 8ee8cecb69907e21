//! Payload assembly

use std::time::Duration;

use chrono::Utc;
use sitrep_api::{ExtraInfo, ModuleErrorEntry, Payload};
use sitrep_store::{InventoryStore, StoreError};
use uuid::Uuid;

use crate::perf::process_memory;
use crate::scheduler::RunReport;

/// Build the payload handed to backends
///
/// `module_errors` is sorted by module name.
///
/// # Errors
/// Returns an error if the store snapshot fails.
pub async fn assemble(
    store: &dyn InventoryStore,
    report: &RunReport,
    agent: Uuid,
    version: &str,
    duration: Duration,
) -> Result<Payload, StoreError> {
    let mut payload = store.snapshot_payload().await?;
    payload.extra = ExtraInfo {
        agent,
        version: version.to_string(),
        timestamp: Utc::now(),
        duration,
        // BTreeMap iteration is already name-ordered
        module_errors: report
            .errors
            .iter()
            .map(|(module, message)| ModuleErrorEntry {
                module: module.clone(),
                message: message.clone(),
            })
            .collect(),
        perf: process_memory(),
    };
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use sitrep_store::{InventoryStoreExt, MemoryStore};

    use super::*;

    #[tokio::test]
    async fn test_assemble_sorts_errors_and_sets_metadata() {
        let agent = Uuid::new_v4();
        let store = MemoryStore::new(agent);
        store.ensure_host().await.unwrap();

        let mut report = RunReport::default();
        report.errors.insert("zeta".into(), "late".into());
        report.errors.insert("alpha".into(), "early".into());

        let payload = assemble(&store, &report, agent, "1.2.3", Duration::from_millis(5))
            .await
            .unwrap();

        assert_eq!(payload.machines.len(), 1);
        assert!(payload.host().is_some());
        assert_eq!(payload.extra.agent, agent);
        assert_eq!(payload.extra.version, "1.2.3");
        let modules: Vec<_> = payload
            .extra
            .module_errors
            .iter()
            .map(|e| e.module.as_str())
            .collect();
        assert_eq!(modules, ["alpha", "zeta"]);
    }
}
