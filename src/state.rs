//! Canonical lifecycle states and the directed graph of legal transitions.
//!
//! Every other component trusts that a persisted state is a reachable point
//! in this graph, so all state changes are funnelled through
//! [`assert_transition`]. The graph itself is pure data.

use crate::error::LifecycleError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum FilingState {
    #[n(0)]
    Draft,
    #[n(1)]
    ReadyToFile,
    #[n(2)]
    ActionRequired,
    #[n(3)]
    SubmittedToCa,
    #[n(4)]
    CaApproved,
    #[n(5)]
    EriInProgress,
    #[n(6)]
    EriAckReceived,
    #[n(7)]
    Filed,
    #[n(8)]
    EriFailed,
    #[n(9)]
    Cancelled,
}

impl FilingState {
    pub const ALL: [FilingState; 10] = [
        FilingState::Draft,
        FilingState::ReadyToFile,
        FilingState::ActionRequired,
        FilingState::SubmittedToCa,
        FilingState::CaApproved,
        FilingState::EriInProgress,
        FilingState::EriAckReceived,
        FilingState::Filed,
        FilingState::EriFailed,
        FilingState::Cancelled,
    ];

    /// `Filed` is the end of the line. `Cancelled` can still be reset to
    /// `Draft`, so it does not count as terminal here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FilingState::Filed)
    }
}

impl std::fmt::Display for FilingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FilingState::Draft => "DRAFT",
            FilingState::ReadyToFile => "READY_TO_FILE",
            FilingState::ActionRequired => "ACTION_REQUIRED",
            FilingState::SubmittedToCa => "SUBMITTED_TO_CA",
            FilingState::CaApproved => "CA_APPROVED",
            FilingState::EriInProgress => "ERI_IN_PROGRESS",
            FilingState::EriAckReceived => "ERI_ACK_RECEIVED",
            FilingState::Filed => "FILED",
            FilingState::EriFailed => "ERI_FAILED",
            FilingState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Allowed targets for each state.
///
/// `EriFailed -> ActionRequired` is the escalation edge and
/// `EriFailed -> CaApproved` the admin rescue edge; every recovery path
/// stays inside this table.
pub fn allowed_next_states(current: FilingState) -> &'static [FilingState] {
    use FilingState::*;
    match current {
        Draft => &[ReadyToFile, Draft],
        ReadyToFile => &[SubmittedToCa, Draft, ActionRequired],
        SubmittedToCa => &[CaApproved, ActionRequired, Cancelled],
        ActionRequired => &[ReadyToFile, SubmittedToCa],
        CaApproved => &[EriInProgress, Cancelled],
        EriInProgress => &[EriAckReceived, EriFailed],
        EriAckReceived => &[Filed],
        EriFailed => &[EriInProgress, Cancelled, ActionRequired, CaApproved],
        Filed => &[],
        Cancelled => &[Draft],
    }
}

/// Validate a proposed state change.
///
/// A same-state transition is always accepted so idempotent re-application
/// of the same request is a no-op for callers.
pub fn assert_transition(
    current: FilingState,
    target: FilingState,
) -> Result<(), LifecycleError> {
    if current == target {
        return Ok(());
    }
    if allowed_next_states(current).contains(&target) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition {
            from: current,
            to: target,
        })
    }
}
