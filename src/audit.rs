//! Append-only audit records.
//!
//! One event per accepted transition attempt, plus call-start and raw
//! gateway response evidence. Events are never mutated or deleted;
//! consumers order by timestamp, not by insertion batch.

use chrono::Utc;

use crate::filing::TimeStamp;
use crate::state::FilingState;

pub const SYSTEM_ACTOR: &str = "SYSTEM";
pub const RECOVERY_ACTOR: &str = "SYSTEM_RECOVERY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ActorRole {
    #[n(0)]
    EndUser,
    #[n(1)]
    Ca,
    #[n(2)]
    Admin,
    #[n(3)]
    System,
    #[n(4)]
    SystemRecovery,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AuditEvent {
    #[n(0)]
    pub filing_id: String,
    #[n(1)]
    pub from: FilingState,
    #[n(2)]
    pub to: FilingState,
    #[n(3)]
    pub actor_id: String,
    #[n(4)]
    pub actor_role: ActorRole,
    #[n(5)]
    pub timestamp: TimeStamp<Utc>,
    #[n(6)]
    pub payload: Option<String>,
}

impl AuditEvent {
    pub fn transition(
        filing_id: impl Into<String>,
        from: FilingState,
        to: FilingState,
        actor_id: impl Into<String>,
        actor_role: ActorRole,
    ) -> Self {
        Self {
            filing_id: filing_id.into(),
            from,
            to,
            actor_id: actor_id.into(),
            actor_role,
            timestamp: TimeStamp::now(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Evidence event that is not itself a state change; recorded as a
    /// same-state entry so the record shape stays uniform.
    pub fn note(
        filing_id: impl Into<String>,
        at: FilingState,
        actor_id: impl Into<String>,
        actor_role: ActorRole,
        payload: impl Into<String>,
    ) -> Self {
        Self::transition(filing_id, at, at, actor_id, actor_role).with_payload(payload)
    }

    pub fn is_state_change(&self) -> bool {
        self.from != self.to
    }
}
