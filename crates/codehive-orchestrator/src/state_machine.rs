//! Pure state machine for the TDD phase cycle
//!
//! `transition(state, event) -> (state, actions)` has no I/O. The cycle
//! engine feeds it the outcome of a phase and then carries out the returned
//! actions in order.
//!
//! - Invalid transitions go to `Failed` (never panic)
//! - Every phase outcome snapshots the workspace before anything else

use codehive_core::{Cycle, CycleStatus, Phase};
use codehive_git::checkpoint_branch_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleState {
    Active(Phase),
    /// Waiting on blocking queries, resumes into the held phase
    Paused(Phase),
    Completed,
    Failed { error: String },
}

impl CycleState {
    pub fn of(cycle: &Cycle) -> Self {
        match cycle.status {
            CycleStatus::Active => Self::Active(cycle.phase),
            CycleStatus::Paused => Self::Paused(cycle.phase),
            CycleStatus::Completed => Self::Completed,
            CycleStatus::Failed => Self::Failed {
                error: "cycle already failed".to_string(),
            },
        }
    }

    /// Write this state back onto a cycle record
    pub fn apply_to(&self, cycle: &mut Cycle) {
        match self {
            Self::Active(phase) => {
                cycle.phase = *phase;
                cycle.status = CycleStatus::Active;
            }
            Self::Paused(phase) => {
                cycle.phase = *phase;
                cycle.status = CycleStatus::Paused;
            }
            Self::Completed => cycle.status = CycleStatus::Completed,
            Self::Failed { .. } => cycle.status = CycleStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEvent {
    /// RED produced failing tests
    TestsWritten { feature: String, count: usize },
    /// GREEN produced implementations for every failing test
    ImplementationWritten { feature: String, count: usize },
    /// REFACTOR finished (possibly keeping originals)
    Refactored { feature: String, count: usize },
    ReviewPassed { feature: String },
    ReviewFailed { failing_tests: Vec<String> },
    /// Pending blocking queries hold the cycle
    Blocked { query_ids: Vec<String> },
    Resumed,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleAction {
    TakeSnapshot { phase: Phase },
    Checkpoint { tag: String },
    Commit { phase: Phase, message: String },
    Rollback { branch: String },
    OpenMergeRequest,
    Log { message: String },
}

pub fn transition(state: CycleState, event: CycleEvent) -> (CycleState, Vec<CycleAction>) {
    match (state, event) {
        (CycleState::Active(Phase::Red), CycleEvent::TestsWritten { feature, count }) => (
            CycleState::Active(Phase::Green),
            vec![
                CycleAction::TakeSnapshot { phase: Phase::Red },
                CycleAction::Checkpoint {
                    tag: Phase::Red.tag().to_string(),
                },
                CycleAction::Commit {
                    phase: Phase::Red,
                    message: format!("add failing tests for {}", feature),
                },
                CycleAction::Log {
                    message: format!("RED complete: {} failing tests", count),
                },
            ],
        ),

        (
            CycleState::Active(Phase::Green),
            CycleEvent::ImplementationWritten { feature, count },
        ) => (
            CycleState::Active(Phase::Refactor),
            vec![
                CycleAction::TakeSnapshot {
                    phase: Phase::Green,
                },
                CycleAction::Checkpoint {
                    tag: Phase::Green.tag().to_string(),
                },
                CycleAction::Commit {
                    phase: Phase::Green,
                    message: format!("implement {}", feature),
                },
                CycleAction::Log {
                    message: format!("GREEN complete: {} tests passing", count),
                },
            ],
        ),

        (CycleState::Active(Phase::Refactor), CycleEvent::Refactored { feature, count }) => (
            CycleState::Active(Phase::Review),
            vec![
                CycleAction::TakeSnapshot {
                    phase: Phase::Refactor,
                },
                CycleAction::Commit {
                    phase: Phase::Refactor,
                    message: format!("clean up {}", feature),
                },
                CycleAction::Log {
                    message: format!("REFACTOR complete: {} artifacts reviewed", count),
                },
            ],
        ),

        (CycleState::Active(Phase::Review), CycleEvent::ReviewPassed { feature }) => (
            CycleState::Completed,
            vec![
                CycleAction::TakeSnapshot {
                    phase: Phase::Review,
                },
                CycleAction::OpenMergeRequest,
                CycleAction::Log {
                    message: format!("REVIEW passed for {}", feature),
                },
            ],
        ),

        (CycleState::Active(Phase::Review), CycleEvent::ReviewFailed { failing_tests }) => (
            CycleState::Active(Phase::Green),
            vec![
                CycleAction::TakeSnapshot {
                    phase: Phase::Review,
                },
                CycleAction::Rollback {
                    branch: checkpoint_branch_name(Phase::Green.tag()),
                },
                CycleAction::Log {
                    message: format!(
                        "REVIEW failed: {} failing tests, back to GREEN",
                        failing_tests.len()
                    ),
                },
            ],
        ),

        (CycleState::Active(phase), CycleEvent::Blocked { query_ids }) => (
            CycleState::Paused(phase),
            vec![CycleAction::Log {
                message: format!(
                    "{} blocked on {} pending queries",
                    phase,
                    query_ids.len()
                ),
            }],
        ),

        // Already paused: stay paused
        (CycleState::Paused(phase), CycleEvent::Blocked { .. }) => {
            (CycleState::Paused(phase), vec![])
        }

        (CycleState::Paused(phase), CycleEvent::Resumed) => (
            CycleState::Active(phase),
            vec![CycleAction::Log {
                message: format!("Resuming in {}", phase),
            }],
        ),

        (CycleState::Active(phase), CycleEvent::Error { message })
        | (CycleState::Paused(phase), CycleEvent::Error { message }) => (
            CycleState::Failed {
                error: message.clone(),
            },
            vec![CycleAction::Log {
                message: format!("Cycle failed in {}: {}", phase, message),
            }],
        ),

        (CycleState::Completed, event) => (
            CycleState::Failed {
                error: format!("Invalid transition from Completed on event: {:?}", event),
            },
            vec![],
        ),

        (CycleState::Failed { error }, event) => (
            CycleState::Failed {
                error: format!(
                    "Invalid transition from Failed state (error: {}) on event: {:?}",
                    error, event
                ),
            },
            vec![],
        ),

        (state, event) => (
            CycleState::Failed {
                error: format!(
                    "Invalid state transition: {:?} cannot handle event {:?}",
                    state, event
                ),
            },
            vec![],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature() -> String {
        "login".to_string()
    }

    #[test]
    fn test_happy_path_full_flow() {
        let (state, actions) = transition(
            CycleState::Active(Phase::Red),
            CycleEvent::TestsWritten {
                feature: feature(),
                count: 3,
            },
        );
        assert_eq!(state, CycleState::Active(Phase::Green));
        assert_eq!(actions[0], CycleAction::TakeSnapshot { phase: Phase::Red });
        assert_eq!(
            actions[1],
            CycleAction::Checkpoint {
                tag: "red".to_string()
            }
        );
        assert_eq!(
            actions[2],
            CycleAction::Commit {
                phase: Phase::Red,
                message: "add failing tests for login".to_string()
            }
        );

        let (state, _) = transition(
            state,
            CycleEvent::ImplementationWritten {
                feature: feature(),
                count: 3,
            },
        );
        assert_eq!(state, CycleState::Active(Phase::Refactor));

        let (state, actions) = transition(
            state,
            CycleEvent::Refactored {
                feature: feature(),
                count: 1,
            },
        );
        assert_eq!(state, CycleState::Active(Phase::Review));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, CycleAction::Checkpoint { .. })));

        let (state, actions) = transition(state, CycleEvent::ReviewPassed { feature: feature() });
        assert_eq!(state, CycleState::Completed);
        assert!(actions.contains(&CycleAction::OpenMergeRequest));
    }

    #[test]
    fn test_snapshot_precedes_commit() {
        let (_, actions) = transition(
            CycleState::Active(Phase::Green),
            CycleEvent::ImplementationWritten {
                feature: feature(),
                count: 1,
            },
        );
        let snapshot = actions
            .iter()
            .position(|a| matches!(a, CycleAction::TakeSnapshot { .. }))
            .unwrap();
        let commit = actions
            .iter()
            .position(|a| matches!(a, CycleAction::Commit { .. }))
            .unwrap();
        assert!(snapshot < commit);
    }

    #[test]
    fn test_review_failure_rolls_back_to_green() {
        let (state, actions) = transition(
            CycleState::Active(Phase::Review),
            CycleEvent::ReviewFailed {
                failing_tests: vec!["t1".to_string()],
            },
        );
        assert_eq!(state, CycleState::Active(Phase::Green));
        assert!(actions.contains(&CycleAction::Rollback {
            branch: "checkpoint/green-phase-start".to_string()
        }));
    }

    #[test]
    fn test_block_and_resume_keep_phase() {
        let (state, _) = transition(
            CycleState::Active(Phase::Green),
            CycleEvent::Blocked {
                query_ids: vec!["q1".to_string()],
            },
        );
        assert_eq!(state, CycleState::Paused(Phase::Green));

        let (state, actions) = transition(state, CycleEvent::Blocked { query_ids: vec![] });
        assert_eq!(state, CycleState::Paused(Phase::Green));
        assert!(actions.is_empty());

        let (state, _) = transition(state, CycleEvent::Resumed);
        assert_eq!(state, CycleState::Active(Phase::Green));
    }

    #[test]
    fn test_out_of_order_event_fails() {
        let (state, actions) = transition(
            CycleState::Active(Phase::Red),
            CycleEvent::ReviewPassed { feature: feature() },
        );
        assert!(matches!(state, CycleState::Failed { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_terminal_states_reject_events() {
        let (state, _) = transition(CycleState::Completed, CycleEvent::Resumed);
        assert!(matches!(state, CycleState::Failed { .. }));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_error_from_paused() {
        let (state, _) = transition(
            CycleState::Paused(Phase::Refactor),
            CycleEvent::Error {
                message: "operator abort".to_string(),
            },
        );
        assert_eq!(
            state,
            CycleState::Failed {
                error: "operator abort".to_string()
            }
        );
    }
}
