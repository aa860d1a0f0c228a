//! Error taxonomy for the lifecycle subsystem.

use crate::state::FilingState;

/// Errors surfaced by guard, store, orchestrator and rescue operations.
///
/// `InvalidTransition` signals either a programming error or a legitimate
/// race loser; the worker and sweeper swallow it as a no-op, synchronous
/// callers see it directly.
#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error("illegal state transition: {from} -> {to}")]
    InvalidTransition { from: FilingState, to: FilingState },
    #[error("filing not found: {0}")]
    NotFound(String),
    #[error("access denied for actor {actor}")]
    AccessDenied { actor: String },
    #[error("blocking information requests pending ({open} open)")]
    BlockingRequestsPending { open: usize },
    #[error("retries exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("codec failure: {0}")]
    Codec(String),
}

/// Classified failures raised by the gateway adapter.
///
/// The classification drives the recovery policy selector, so the adapter
/// must tag errors with a machine-readable category rather than a bare
/// string.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway transient failure: {0}")]
    Transient(String),
    #[error("gateway rejected submission: {0}")]
    Rejected(String),
    #[error("gateway authentication failed: {0}")]
    AuthFailed(String),
}
