//! Run state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a deployment run.
///
/// ```text
/// Idle -> Planning -> BatchInProgress -> Monitoring -> BatchComplete -> (next batch | Completed)
///                                   \-> RollingBack -> RolledBack | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// Nothing started.
    Idle,
    /// Lock held, plan loaded, batches being computed.
    Planning,
    /// A batch (or canary subset, or standby slot) is being drained, deployed and checked.
    BatchInProgress,
    /// A gating metrics watch or acceptance suite is running.
    Monitoring,
    /// The current batch is healthy and back in rotation.
    BatchComplete,
    /// Every server runs the target version.
    Completed,
    /// Restoring the last known-good version.
    RollingBack,
    /// The run's changes were reverted.
    RolledBack,
    /// The run aborted.
    Failed,
}

impl RunState {
    /// Returns a string representation for display.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Planning => "Planning",
            Self::BatchInProgress => "BatchInProgress",
            Self::Monitoring => "Monitoring",
            Self::BatchComplete => "BatchComplete",
            Self::Completed => "Completed",
            Self::RollingBack => "RollingBack",
            Self::RolledBack => "RolledBack",
            Self::Failed => "Failed",
        }
    }

    /// Returns true for `Completed`, `RolledBack` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use RunState::{
            BatchComplete, BatchInProgress, Completed, Failed, Idle, Monitoring, Planning,
            RolledBack, RollingBack,
        };
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, BatchInProgress | RollingBack | Failed)
                | (BatchInProgress, Monitoring | BatchComplete | RollingBack | Failed)
                | (Monitoring, BatchComplete | RollingBack | Failed)
                | (BatchComplete, BatchInProgress | Monitoring | Completed | RollingBack | Failed)
                | (RollingBack, RolledBack | Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            RunState::Idle,
            RunState::Planning,
            RunState::BatchInProgress,
            RunState::BatchComplete,
            RunState::BatchInProgress,
            RunState::Monitoring,
            RunState::BatchComplete,
            RunState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        for terminal in [RunState::Completed, RunState::RolledBack, RunState::Failed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(RunState::Planning));
            assert!(!terminal.can_transition_to(RunState::RollingBack));
        }
    }

    #[test]
    fn test_cannot_skip_rollback() {
        assert!(!RunState::BatchInProgress.can_transition_to(RunState::RolledBack));
        assert!(!RunState::Idle.can_transition_to(RunState::BatchInProgress));
    }
}
