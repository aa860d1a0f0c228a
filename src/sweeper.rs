//! Periodic recovery scan for filings stuck mid-submission.
//!
//! A filing left in `ERI_IN_PROGRESS` past the staleness threshold means a
//! crashed worker or a lost callback. The sweeper first asks the gateway
//! what actually happened (never guesses), then drives the recovery policy
//! decision through the same state-as-lease transaction pattern the worker
//! uses, so a sweep racing a live worker is a no-op on one side.

use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::{ActorRole, AuditEvent, RECOVERY_ACTOR};
use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::filing::TimeStamp;
use crate::gateway::{EriGateway, GatewayStatus};
use crate::policy::{self, FailureKind, RecoveryDecision};
use crate::pool::SubmissionPool;
use crate::state::FilingState;
use crate::store::{Commit, FilingStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The submission had succeeded and only the acknowledgment was lost.
    RecoveredFiled { ack_number: String },
    /// Sent back through `ERI_FAILED -> ERI_IN_PROGRESS` and re-dispatched.
    Retried { attempt: u32 },
    /// Moved to a state requiring human attention (or parked terminally).
    Escalated { target: FilingState },
    /// Nothing to do: not stuck anymore, still pending remotely, or the
    /// next retry is not due yet.
    Skipped,
}

/// Outcome tally of one sweep. Per-filing failures are collected here and
/// never abort the rest of the scan.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub examined: usize,
    pub recovered: usize,
    pub retried: usize,
    pub escalated: usize,
    pub skipped: usize,
    pub errors: Vec<(String, String)>,
}

pub struct RecoverySweeper {
    store: FilingStore,
    gateway: Arc<dyn EriGateway>,
    pool: Arc<SubmissionPool>,
    config: LifecycleConfig,
}

impl RecoverySweeper {
    pub fn new(
        store: FilingStore,
        gateway: Arc<dyn EriGateway>,
        pool: Arc<SubmissionPool>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            pool,
            config,
        }
    }

    /// One full scan over every stuck filing.
    pub fn sweep(&self) -> Result<SweepReport, LifecycleError> {
        let stuck = self.store.stuck_filings(self.config.staleness_threshold)?;
        let mut report = SweepReport {
            examined: stuck.len(),
            ..SweepReport::default()
        };
        info!(stuck = stuck.len(), "recovery sweep started");

        for filing in stuck {
            match self.recover(&filing.id) {
                Ok(RecoveryOutcome::RecoveredFiled { .. }) => report.recovered += 1,
                Ok(RecoveryOutcome::Retried { .. }) => report.retried += 1,
                Ok(RecoveryOutcome::Escalated { .. }) => report.escalated += 1,
                Ok(RecoveryOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(filing_id = %filing.id, error = %e, "recovery failed for filing");
                    report.errors.push((filing.id.clone(), e.to_string()));
                }
            }
        }

        info!(
            recovered = report.recovered,
            retried = report.retried,
            escalated = report.escalated,
            skipped = report.skipped,
            errors = report.errors.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }

    /// Recover a single stuck filing.
    pub fn recover(&self, filing_id: &str) -> Result<RecoveryOutcome, LifecycleError> {
        let filing = self.store.load(filing_id)?;
        if filing.state != FilingState::EriInProgress {
            return Ok(RecoveryOutcome::Skipped);
        }

        let reference = filing
            .checksum
            .clone()
            .unwrap_or_else(|| sha256::digest(&filing.payload));

        // Disambiguate before deciding: "actually failed" and "succeeded
        // but acknowledgment lost" are indistinguishable from our side.
        match self.gateway.check_status(&reference) {
            Ok(GatewayStatus::Accepted { ack_number }) => {
                self.recover_filed(filing_id, &ack_number)
            }
            Ok(GatewayStatus::Pending) => {
                info!(%filing_id, "submission still pending at gateway, leaving for next sweep");
                Ok(RecoveryOutcome::Skipped)
            }
            Ok(GatewayStatus::Rejected { reason }) => {
                let kind = FailureKind::Rejected { detail: reason };
                self.apply_decision(
                    filing_id,
                    policy::select_strategy(Some(&kind), filing.retry_count),
                )
            }
            Ok(GatewayStatus::NotFound) => self.apply_decision(
                filing_id,
                policy::select_strategy(filing.failure.as_ref(), filing.retry_count),
            ),
            Err(e) => {
                // The status check itself failed; fall back to whatever the
                // last episode recorded.
                warn!(%filing_id, error = %e, "status check failed during recovery");
                self.apply_decision(
                    filing_id,
                    policy::select_strategy(filing.failure.as_ref(), filing.retry_count),
                )
            }
        }
    }

    /// The submission went through and the ack was lost: finish the happy
    /// path on the worker's behalf.
    fn recover_filed(
        &self,
        filing_id: &str,
        ack_number: &str,
    ) -> Result<RecoveryOutcome, LifecycleError> {
        let outcome = self.store.update(filing_id, |filing| {
            if filing.state != FilingState::EriInProgress {
                return Ok(Commit::skip(RecoveryOutcome::Skipped));
            }
            filing.transition(FilingState::EriAckReceived)?;
            filing.transition(FilingState::Filed)?;
            filing.ack_number = Some(ack_number.to_string());
            filing.filed_at = Some(TimeStamp::now());
            filing.rejection_reason = None;
            filing.failure = None;

            let events = vec![
                AuditEvent::transition(
                    filing_id,
                    FilingState::EriInProgress,
                    FilingState::EriAckReceived,
                    RECOVERY_ACTOR,
                    ActorRole::SystemRecovery,
                )
                .with_payload(format!("acknowledgment recovered via status check: {ack_number}")),
                AuditEvent::transition(
                    filing_id,
                    FilingState::EriAckReceived,
                    FilingState::Filed,
                    RECOVERY_ACTOR,
                    ActorRole::SystemRecovery,
                ),
            ];
            Ok(Commit::persist(
                RecoveryOutcome::RecoveredFiled {
                    ack_number: ack_number.to_string(),
                },
                events,
            ))
        })?;

        if let RecoveryOutcome::RecoveredFiled { ack_number } = &outcome {
            info!(%filing_id, %ack_number, "stuck filing recovered as FILED");
        }
        Ok(outcome)
    }

    /// Apply the recovery policy to a filing already parked in
    /// `ERI_FAILED` (immediate recovery, as opposed to the staleness scan).
    /// The embedding application calls this from its failure dashboard or
    /// cron hook.
    pub fn recover_failed(&self, filing_id: &str) -> Result<RecoveryOutcome, LifecycleError> {
        let filing = self.store.load(filing_id)?;
        if filing.state != FilingState::EriFailed {
            return Ok(RecoveryOutcome::Skipped);
        }

        match policy::select_strategy(filing.failure.as_ref(), filing.retry_count) {
            RecoveryDecision::Retry {
                max_retries,
                backoff: _,
                reason,
            } => {
                if filing.retry_count >= max_retries {
                    return self.escalate_failed(
                        filing_id,
                        FilingState::EriFailed,
                        "retries exhausted".to_string(),
                    );
                }
                let outcome = self.store.update(filing_id, |filing| {
                    if filing.state != FilingState::EriFailed {
                        return Ok(Commit::skip(RecoveryOutcome::Skipped));
                    }
                    filing.transition(FilingState::EriInProgress)?;
                    filing.retry_count += 1;
                    let event = AuditEvent::transition(
                        filing_id,
                        FilingState::EriFailed,
                        FilingState::EriInProgress,
                        RECOVERY_ACTOR,
                        ActorRole::SystemRecovery,
                    )
                    .with_payload(format!("{reason}; retry attempt {}", filing.retry_count));
                    Ok(Commit::persist(
                        RecoveryOutcome::Retried {
                            attempt: filing.retry_count,
                        },
                        vec![event],
                    ))
                })?;
                if matches!(outcome, RecoveryOutcome::Retried { .. }) {
                    self.pool.dispatch(filing_id);
                }
                Ok(outcome)
            }
            RecoveryDecision::Escalate { target, reason } => {
                self.escalate_failed(filing_id, target, reason)
            }
        }
    }

    /// Move an `ERI_FAILED` filing to its escalation target (or keep it
    /// there with a final reason).
    fn escalate_failed(
        &self,
        filing_id: &str,
        target: FilingState,
        reason: String,
    ) -> Result<RecoveryOutcome, LifecycleError> {
        self.store.update(filing_id, |filing| {
            if filing.state != FilingState::EriFailed {
                return Ok(Commit::skip(RecoveryOutcome::Skipped));
            }
            filing.transition(target)?;
            filing.rejection_reason = Some(reason.clone());
            let event = AuditEvent::transition(
                filing_id,
                FilingState::EriFailed,
                target,
                RECOVERY_ACTOR,
                ActorRole::SystemRecovery,
            )
            .with_payload(reason.clone());
            Ok(Commit::persist(RecoveryOutcome::Escalated { target }, vec![event]))
        })
    }

    fn apply_decision(
        &self,
        filing_id: &str,
        decision: RecoveryDecision,
    ) -> Result<RecoveryOutcome, LifecycleError> {
        match decision {
            RecoveryDecision::Retry {
                max_retries,
                backoff,
                reason,
            } => {
                let filing = self.store.load(filing_id)?;
                if filing.retry_count >= max_retries {
                    return self.escalate(
                        filing_id,
                        FilingState::EriFailed,
                        "retries exhausted".to_string(),
                    );
                }
                // Honor the backoff schedule: attempt n is only due once
                // the filing has been idle past its delay.
                let delay = backoff.delay_for_attempt(filing.retry_count + 1);
                let due = self.config.staleness_threshold + delay;
                if filing.updated_at.age(&TimeStamp::now()) < due {
                    return Ok(RecoveryOutcome::Skipped);
                }
                self.retry(filing_id, &reason)
            }
            RecoveryDecision::Escalate { target, reason } => {
                self.escalate(filing_id, target, reason)
            }
        }
    }

    /// `ERI_IN_PROGRESS -> ERI_FAILED -> ERI_IN_PROGRESS` in one
    /// transaction, then hand the filing back to the pool.
    fn retry(&self, filing_id: &str, reason: &str) -> Result<RecoveryOutcome, LifecycleError> {
        let outcome = self.store.update(filing_id, |filing| {
            if filing.state != FilingState::EriInProgress {
                return Ok(Commit::skip(RecoveryOutcome::Skipped));
            }
            filing.transition(FilingState::EriFailed)?;
            filing.transition(FilingState::EriInProgress)?;
            filing.retry_count += 1;

            let events = vec![
                AuditEvent::transition(
                    filing_id,
                    FilingState::EriInProgress,
                    FilingState::EriFailed,
                    RECOVERY_ACTOR,
                    ActorRole::SystemRecovery,
                )
                .with_payload(reason.to_string()),
                AuditEvent::transition(
                    filing_id,
                    FilingState::EriFailed,
                    FilingState::EriInProgress,
                    RECOVERY_ACTOR,
                    ActorRole::SystemRecovery,
                )
                .with_payload(format!("automatic retry attempt {}", filing.retry_count)),
            ];
            Ok(Commit::persist(
                RecoveryOutcome::Retried {
                    attempt: filing.retry_count,
                },
                events,
            ))
        })?;

        if let RecoveryOutcome::Retried { attempt } = &outcome {
            info!(%filing_id, attempt = *attempt, "stuck filing re-dispatched");
            self.pool.dispatch(filing_id);
        }
        Ok(outcome)
    }

    /// Park the filing where a human can see it, recording the final
    /// reason. Escalation to `ACTION_REQUIRED` hops through `ERI_FAILED`
    /// so every edge stays inside the registry.
    fn escalate(
        &self,
        filing_id: &str,
        target: FilingState,
        reason: String,
    ) -> Result<RecoveryOutcome, LifecycleError> {
        let outcome = self.store.update(filing_id, |filing| {
            if filing.state != FilingState::EriInProgress {
                return Ok(Commit::skip(RecoveryOutcome::Skipped));
            }
            let mut events = Vec::new();

            filing.transition(FilingState::EriFailed)?;
            events.push(
                AuditEvent::transition(
                    filing_id,
                    FilingState::EriInProgress,
                    FilingState::EriFailed,
                    RECOVERY_ACTOR,
                    ActorRole::SystemRecovery,
                )
                .with_payload(reason.clone()),
            );
            if target != FilingState::EriFailed {
                filing.transition(target)?;
                events.push(
                    AuditEvent::transition(
                        filing_id,
                        FilingState::EriFailed,
                        target,
                        RECOVERY_ACTOR,
                        ActorRole::SystemRecovery,
                    )
                    .with_payload(reason.clone()),
                );
            }
            filing.rejection_reason = Some(reason.clone());

            Ok(Commit::persist(RecoveryOutcome::Escalated { target }, events))
        })?;

        if let RecoveryOutcome::Escalated { target } = &outcome {
            warn!(%filing_id, %target, %reason, "stuck filing escalated");
        }
        Ok(outcome)
    }
}
