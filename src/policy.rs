//! Recovery policy: what to do with a failed or stuck submission.
//!
//! The selector is a pure decision table over the persisted failure
//! classification and the retry counter. It is evaluated fresh on every
//! recovery attempt and its output is never stored.

use std::time::Duration;

use crate::error::GatewayError;
use crate::state::FilingState;

pub const MAX_TRANSIENT_RETRIES: u32 = 3;
pub const MAX_UNKNOWN_RETRIES: u32 = 1;

/// Machine-readable failure classification persisted on the filing, so a
/// recovery decision can be made after a process restart without parsing
/// the human-readable reason text.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum FailureKind {
    /// Timeout, connection reset, 502/503 and friends.
    #[n(0)]
    Transient {
        #[n(0)]
        detail: String,
    },
    /// The remote system rejected the submission payload.
    #[n(1)]
    Rejected {
        #[n(0)]
        detail: String,
    },
    /// Credentials or signing failure against the gateway.
    #[n(2)]
    AuthFailed {
        #[n(0)]
        detail: String,
    },
    /// Anything we could not classify (e.g. a crashed worker left no trace).
    #[n(3)]
    Unknown {
        #[n(0)]
        detail: String,
    },
}

impl From<&GatewayError> for FailureKind {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::Transient(d) => FailureKind::Transient { detail: d.clone() },
            GatewayError::Rejected(d) => FailureKind::Rejected { detail: d.clone() },
            GatewayError::AuthFailed(d) => FailureKind::AuthFailed { detail: d.clone() },
        }
    }
}

/// Exponential backoff between automatic retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (1-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // exponent clamp keeps the intermediate finite before the cap
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    Retry {
        max_retries: u32,
        backoff: BackoffPolicy,
        reason: String,
    },
    Escalate {
        target: FilingState,
        reason: String,
    },
}

/// Decide how to react to a failure episode.
///
/// Exhaustive over [`FailureKind`]; `None` means the episode left no
/// classification behind (crashed worker) and is treated as unknown.
pub fn select_strategy(failure: Option<&FailureKind>, retry_count: u32) -> RecoveryDecision {
    match failure {
        Some(FailureKind::Transient { detail }) => RecoveryDecision::Retry {
            max_retries: MAX_TRANSIENT_RETRIES,
            backoff: BackoffPolicy::default(),
            reason: format!("transient gateway failure: {detail}"),
        },
        Some(FailureKind::AuthFailed { detail }) => RecoveryDecision::Escalate {
            target: FilingState::ActionRequired,
            reason: format!("gateway authentication failed, re-authentication required: {detail}"),
        },
        Some(FailureKind::Rejected { detail }) => RecoveryDecision::Escalate {
            target: FilingState::ActionRequired,
            reason: format!("submission rejected, data correction required: {detail}"),
        },
        Some(FailureKind::Unknown { .. }) | None if retry_count < MAX_UNKNOWN_RETRIES => {
            RecoveryDecision::Retry {
                max_retries: MAX_UNKNOWN_RETRIES,
                backoff: BackoffPolicy::default(),
                reason: "unclassified failure, retrying once".into(),
            }
        }
        Some(FailureKind::Unknown { .. }) | None => RecoveryDecision::Escalate {
            target: FilingState::EriFailed,
            reason: "retries exhausted".into(),
        },
    }
}
