//! Per-module state machine

use serde::{Deserialize, Serialize};

/// Lifecycle of a module within one run
///
/// `Pending -> Running -> Succeeded | Failed`, or `Pending -> Skipped` for
/// disabled modules and modules dropped for missing dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl ModuleState {
    /// Check whether moving to `next` is legal
    #[must_use]
    pub fn can_transition_to(&self, next: ModuleState) -> bool {
        matches!(
            (self, next),
            (ModuleState::Pending, ModuleState::Running | ModuleState::Skipped)
                | (ModuleState::Running, ModuleState::Succeeded | ModuleState::Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModuleState::Succeeded | ModuleState::Failed | ModuleState::Skipped
        )
    }
}

/// Outcome stamped on a supervision span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    InternalError,
}

impl SpanStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "ok",
            SpanStatus::InternalError => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(ModuleState::Pending.can_transition_to(ModuleState::Running));
        assert!(ModuleState::Pending.can_transition_to(ModuleState::Skipped));
        assert!(ModuleState::Running.can_transition_to(ModuleState::Failed));
        assert!(!ModuleState::Pending.can_transition_to(ModuleState::Succeeded));
        assert!(!ModuleState::Skipped.can_transition_to(ModuleState::Running));
        assert!(!ModuleState::Succeeded.can_transition_to(ModuleState::Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ModuleState::Skipped.is_terminal());
        assert!(!ModuleState::Running.is_terminal());
    }
}
