//! Dependency-ordered module execution
//!
//! The scheduler validates the dependency graph, derives a deterministic
//! topological order and runs each module inside a supervision span. Module
//! errors are collected into the [`RunReport`] and never stop the run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use sitrep_store::InventoryStore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::error::SchedulerError;
use crate::module::{Module, ModuleContext};
use crate::state::{ModuleState, SpanStatus};
use crate::supervisor::{NoopSupervisor, Supervisor};

/// Policy knobs of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Drop modules with unknown or disabled dependencies instead of failing
    pub ignore_missing_deps: bool,
    /// Run each dependency layer concurrently
    pub parallel: bool,
}

/// Validated execution plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Topological order, ties broken by name
    pub order: Vec<String>,
    /// Modules grouped by dependency depth, each layer sorted by name
    pub layers: Vec<Vec<String>>,
    /// Dropped because a dependency is missing
    pub skipped: Vec<String>,
}

/// Outcome of a scheduler run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Planned order
    pub order: Vec<String>,
    /// Modules whose `run` was invoked, in start order
    pub executed: Vec<String>,
    /// Per-run error table, keyed by module name
    pub errors: BTreeMap<String, String>,
    pub timings: BTreeMap<String, Duration>,
    pub states: BTreeMap<String, ModuleState>,
    /// Disabled or dropped modules
    pub skipped: Vec<String>,
    /// The run stopped early
    pub cancelled: bool,
}

impl RunReport {
    /// Module failures as `ModuleFailed` errors, by name
    #[must_use]
    pub fn failures(&self) -> Vec<SchedulerError> {
        self.errors
            .iter()
            .map(|(module, cause)| SchedulerError::ModuleFailed {
                module: module.clone(),
                cause: cause.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn state(&self, module: &str) -> Option<ModuleState> {
        self.states.get(module).copied()
    }
}

struct Outcome {
    name: String,
    error: Option<String>,
    elapsed: Duration,
}

/// Runs the enabled modules of one invocation
pub struct Scheduler {
    modules: BTreeMap<String, Arc<dyn Module>>,
    disabled: BTreeSet<String>,
    supervisor: Arc<dyn Supervisor>,
    options: SchedulerOptions,
    states: Mutex<BTreeMap<String, ModuleState>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        modules: Vec<Arc<dyn Module>>,
        supervisor: Arc<dyn Supervisor>,
        options: SchedulerOptions,
    ) -> Self {
        let modules: BTreeMap<String, Arc<dyn Module>> = modules
            .into_iter()
            .map(|m| (m.name().to_string(), m))
            .collect();
        let states = modules
            .keys()
            .map(|name| (name.clone(), ModuleState::Pending))
            .collect();
        Self {
            modules,
            disabled: BTreeSet::new(),
            supervisor,
            options,
            states: Mutex::new(states),
        }
    }

    /// Scheduler with the no-op supervisor and default options
    #[must_use]
    pub fn with_modules(modules: Vec<Arc<dyn Module>>) -> Self {
        Self::new(modules, Arc::new(NoopSupervisor), SchedulerOptions::default())
    }

    /// Record modules disabled by configuration; they are reported as skipped
    #[must_use]
    pub fn with_disabled(mut self, names: impl IntoIterator<Item = String>) -> Self {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        for name in names {
            if !self.modules.contains_key(&name) {
                states.insert(name.clone(), ModuleState::Skipped);
                self.disabled.insert(name);
            }
        }
        drop(states);
        self
    }

    /// Snapshot of every module's state
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, ModuleState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, name: &str, to: ModuleState) -> Result<(), SchedulerError> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let from = states.get(name).copied().unwrap_or(ModuleState::Pending);
        if !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition {
                module: name.to_string(),
                from,
                to,
            });
        }
        states.insert(name.to_string(), to);
        Ok(())
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Validate the dependency graph and order the modules
    ///
    /// # Errors
    /// Returns `DependencyUnresolvable` (strict mode) or `DependencyCycle`.
    pub fn plan(&self) -> Result<Plan, SchedulerError> {
        let dropped = self.check_references()?;

        let active: BTreeMap<&str, BTreeSet<&str>> = self
            .modules
            .iter()
            .filter(|(name, _)| !dropped.contains(name.as_str()))
            .map(|(name, module)| {
                (name.as_str(), module.dependencies().iter().copied().collect())
            })
            .collect();

        let mut indegree: BTreeMap<&str, usize> =
            active.iter().map(|(name, deps)| (*name, deps.len())).collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, deps) in &active {
            for dep in deps {
                dependents.entry(*dep).or_default().push(*name);
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(active.len());
        while let Some(name) = ready.pop_first() {
            order.push(name);
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() < active.len() {
            let placed: BTreeSet<&str> = order.iter().copied().collect();
            let leftover: BTreeMap<&str, &BTreeSet<&str>> = active
                .iter()
                .filter(|(name, _)| !placed.contains(*name))
                .map(|(name, deps)| (*name, deps))
                .collect();
            return Err(SchedulerError::DependencyCycle {
                modules: find_cycle(&leftover),
            });
        }

        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        for name in &order {
            let level = active[name]
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*name, level);
        }
        let mut layers: Vec<Vec<String>> = Vec::new();
        for (name, level) in &depth {
            if layers.len() <= *level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[*level].push((*name).to_string());
        }

        Ok(Plan {
            order: order.into_iter().map(ToString::to_string).collect(),
            layers,
            skipped: dropped.into_iter().collect(),
        })
    }

    /// Names of modules dropped for missing dependencies, transitively
    fn check_references(&self) -> Result<BTreeSet<String>, SchedulerError> {
        let mut dropped = BTreeSet::new();
        loop {
            let mut changed = false;
            for (name, module) in &self.modules {
                if dropped.contains(name) {
                    continue;
                }
                let missing = module
                    .dependencies()
                    .iter()
                    .find(|dep| !self.modules.contains_key(**dep) || dropped.contains(**dep));
                let Some(missing) = missing else {
                    continue;
                };
                if !self.options.ignore_missing_deps {
                    return Err(SchedulerError::DependencyUnresolvable {
                        module: name.clone(),
                        missing: (*missing).to_string(),
                    });
                }
                warn!(module = %name, missing = *missing, "dropping module with missing dependency");
                dropped.insert(name.clone());
                changed = true;
            }
            if !changed {
                return Ok(dropped);
            }
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Plan, then run every module
    ///
    /// Cancellation is checked before each module (or layer); modules not yet
    /// started stay `Pending` and the report is flagged `cancelled`.
    ///
    /// # Errors
    /// Returns planning errors; module failures are only recorded.
    #[instrument(skip_all, fields(modules = self.modules.len(), parallel = self.options.parallel))]
    pub async fn run(
        &self,
        store: Arc<dyn InventoryStore>,
        cancel: CancellationToken,
    ) -> Result<RunReport, SchedulerError> {
        let plan = self.plan()?;
        info!(order = ?plan.order, "execution plan ready");

        for name in &plan.skipped {
            self.transition(name, ModuleState::Skipped)?;
        }

        let mut report = RunReport {
            order: plan.order.clone(),
            skipped: self
                .disabled
                .iter()
                .chain(plan.skipped.iter())
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            ..RunReport::default()
        };

        if self.options.parallel {
            for layer in &plan.layers {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                report.executed.extend(layer.iter().cloned());
                let outcomes = join_all(
                    layer
                        .iter()
                        .filter_map(|name| self.modules.get(name))
                        .map(|module| self.run_one(module, &store, &cancel)),
                )
                .await;
                for outcome in outcomes {
                    record(&mut report, outcome?);
                }
            }
        } else {
            for name in &plan.order {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let Some(module) = self.modules.get(name) else {
                    continue;
                };
                report.executed.push(name.clone());
                record(&mut report, self.run_one(module, &store, &cancel).await?);
            }
        }

        if report.cancelled {
            warn!(
                executed = report.executed.len(),
                planned = report.order.len(),
                "run cancelled, remaining modules not started"
            );
        }
        report.states = self.states();
        Ok(report)
    }

    async fn run_one(
        &self,
        module: &Arc<dyn Module>,
        store: &Arc<dyn InventoryStore>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, SchedulerError> {
        let name = module.name();
        let mut supervision = self.supervisor.start_child(name);
        self.transition(name, ModuleState::Running)?;

        let span = info_span!("module", name);
        let ctx = ModuleContext::new(cancel.clone(), Arc::clone(store), span.clone());
        debug!(module = name, "module starting");
        let result = module.run(&ctx).instrument(span).await;

        let error = match result {
            Ok(()) => {
                supervision.set_status(SpanStatus::Ok);
                self.transition(name, ModuleState::Succeeded)?;
                None
            }
            Err(e) => {
                warn!(module = name, error = %e, "module failed");
                supervision.set_status(SpanStatus::InternalError);
                self.transition(name, ModuleState::Failed)?;
                Some(e.to_string())
            }
        };
        let elapsed = supervision.finish();

        Ok(Outcome {
            name: name.to_string(),
            error,
            elapsed,
        })
    }
}

fn record(report: &mut RunReport, outcome: Outcome) {
    if let Some(error) = outcome.error {
        report.errors.insert(outcome.name.clone(), error);
    }
    report.timings.insert(outcome.name, outcome.elapsed);
}

/// Members of one cycle among nodes that Kahn's algorithm could not place
fn find_cycle(leftover: &BTreeMap<&str, &BTreeSet<&str>>) -> Vec<String> {
    let Some(start) = leftover.keys().next().copied() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|n| *n == current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
            cycle.sort();
            return cycle;
        }
        path.push(current);
        // every leftover node has at least one leftover dependency
        let next = leftover
            .get(current)
            .and_then(|deps| deps.iter().find(|d| leftover.contains_key(**d)));
        match next {
            Some(next) => current = *next,
            None => {
                let mut all: Vec<String> = leftover.keys().map(ToString::to_string).collect();
                all.sort();
                return all;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use sitrep_store::MemoryStore;
    use uuid::Uuid;

    use super::*;
    use crate::error::ModuleError;

    struct Stub {
        name: &'static str,
        deps: &'static [&'static str],
        fail: bool,
    }

    fn stub(name: &'static str, deps: &'static [&'static str]) -> Arc<dyn Module> {
        Arc::new(Stub {
            name,
            deps,
            fail: false,
        })
    }

    #[async_trait]
    impl Module for Stub {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }

        async fn run(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            if self.fail {
                return Err(ModuleError::msg("boom"));
            }
            Ok(())
        }
    }

    fn store() -> Arc<dyn InventoryStore> {
        Arc::new(MemoryStore::new(Uuid::new_v4()))
    }

    #[test]
    fn test_order_is_topological_and_name_tie_broken() {
        let scheduler = Scheduler::with_modules(vec![
            stub("c", &["a"]),
            stub("b", &[]),
            stub("a", &[]),
            stub("d", &["c", "b"]),
        ]);
        let plan = scheduler.plan().unwrap();
        assert_eq!(plan.order, ["a", "b", "c", "d"]);
        assert_eq!(
            plan.layers,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()],
                vec!["d".to_string()]
            ]
        );
        // identical on a second call
        assert_eq!(scheduler.plan().unwrap(), plan);
    }

    #[test]
    fn test_ready_set_prefers_smallest_name() {
        let scheduler = Scheduler::with_modules(vec![
            stub("zz", &[]),
            stub("b", &["a"]),
            stub("a", &[]),
        ]);
        assert_eq!(scheduler.plan().unwrap().order, ["a", "b", "zz"]);
    }

    #[test]
    fn test_cycle_names_members() {
        let scheduler = Scheduler::with_modules(vec![
            stub("a", &["b"]),
            stub("b", &["c"]),
            stub("c", &["b"]),
            stub("x", &[]),
        ]);
        assert_eq!(
            scheduler.plan().unwrap_err(),
            SchedulerError::DependencyCycle {
                modules: vec!["b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn test_missing_dependency_strict_and_lenient() {
        let modules = || vec![stub("a", &["z"]), stub("b", &["a"]), stub("c", &[])];

        let strict = Scheduler::with_modules(modules());
        assert_eq!(
            strict.plan().unwrap_err(),
            SchedulerError::DependencyUnresolvable {
                module: "a".into(),
                missing: "z".into()
            }
        );

        let lenient = Scheduler::new(
            modules(),
            Arc::new(NoopSupervisor),
            SchedulerOptions {
                ignore_missing_deps: true,
                parallel: false,
            },
        );
        let plan = lenient.plan().unwrap();
        assert_eq!(plan.order, ["c"]);
        assert_eq!(plan.skipped, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let scheduler = Scheduler::with_modules(vec![
            stub("a", &[]),
            Arc::new(Stub {
                name: "b",
                deps: &["a"],
                fail: true,
            }),
            stub("c", &["b"]),
        ]);
        let report = scheduler
            .run(store(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.executed, ["a", "b", "c"]);
        assert_eq!(report.errors.get("b").map(String::as_str), Some("boom"));
        assert_eq!(report.state("a"), Some(ModuleState::Succeeded));
        assert_eq!(report.state("b"), Some(ModuleState::Failed));
        assert_eq!(report.state("c"), Some(ModuleState::Succeeded));
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.timings.len(), 3);
    }

    #[tokio::test]
    async fn test_parallel_layers_run_everything() {
        let scheduler = Scheduler::new(
            vec![stub("a", &[]), stub("b", &[]), stub("c", &["a", "b"])],
            Arc::new(NoopSupervisor),
            SchedulerOptions {
                ignore_missing_deps: false,
                parallel: true,
            },
        );
        let report = scheduler
            .run(store(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.executed, ["a", "b", "c"]);
        assert!(
            report
                .states
                .values()
                .all(|s| *s == ModuleState::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let scheduler = Scheduler::with_modules(vec![stub("a", &[])])
            .with_disabled(["off".to_string()]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scheduler.run(store(), cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(report.executed.is_empty());
        assert_eq!(report.state("a"), Some(ModuleState::Pending));
        assert_eq!(report.state("off"), Some(ModuleState::Skipped));
        assert_eq!(report.skipped, ["off"]);
    }
}
