//! Process memory statistics

use sitrep_api::PerfStats;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Resident and virtual memory of the current process
///
/// Returns zeroes when the process table cannot be read.
#[must_use]
pub fn process_memory() -> PerfStats {
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new().with_memory(),
    );
    match sys.process(pid) {
        Some(process) => PerfStats {
            heap_alloc: process.memory(),
            heap_sys: process.virtual_memory(),
        },
        None => {
            debug!(%pid, "own process not found in process table");
            PerfStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reports_own_memory() {
        let stats = process_memory();
        assert!(stats.heap_alloc > 0);
        assert!(stats.heap_sys >= stats.heap_alloc);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_refreshes_only_own_process() {
        let pid = Pid::from_u32(std::process::id());
        let mut sys = System::new();
        let refreshed = sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        assert_eq!(refreshed, 1);
        assert_eq!(sys.processes().len(), 1);
    }
}
