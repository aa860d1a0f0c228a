//! Asynchronous executor for the external submission call.
//!
//! Fire-and-forget from the orchestrator's perspective: nothing in here is
//! allowed to propagate past `process_submission`. Failures become state
//! transitions, storage errors become log lines.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::audit::{ActorRole, AuditEvent, SYSTEM_ACTOR};
use crate::error::{GatewayError, LifecycleError};
use crate::gateway::{EriGateway, SubmissionReceipt};
use crate::filing::TimeStamp;
use crate::policy::FailureKind;
use crate::state::FilingState;
use crate::store::{Commit, FilingStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Terminal success: acknowledgment persisted, filing is `FILED`.
    Filed { ack_number: String },
    /// Gateway failure recorded, filing is `ERI_FAILED`.
    Failed,
    /// Filing was not in `ERI_IN_PROGRESS`; nothing was touched.
    Skipped,
    /// Another worker reconciled this filing first; nothing was touched.
    RaceLost,
    /// A storage error prevented reconciliation; logged, not raised.
    Aborted,
}

pub struct SubmissionWorker {
    store: FilingStore,
    gateway: Arc<dyn EriGateway>,
}

impl SubmissionWorker {
    pub fn new(store: FilingStore, gateway: Arc<dyn EriGateway>) -> Self {
        Self { store, gateway }
    }

    /// Process one claimed filing end to end.
    ///
    /// The persisted `ERI_IN_PROGRESS` state is the claim token: anything
    /// else means a duplicate dispatch or a finished race, and the filing
    /// is left untouched. No lock or transaction is held across the
    /// gateway call.
    pub fn process_submission(&self, filing_id: &str) -> ProcessOutcome {
        let filing = match self.store.load(filing_id) {
            Ok(filing) => filing,
            Err(LifecycleError::NotFound(_)) => {
                warn!(%filing_id, "submission job for unknown filing, skipping");
                return ProcessOutcome::Skipped;
            }
            Err(e) => {
                error!(%filing_id, error = %e, "failed to load filing for submission");
                return ProcessOutcome::Aborted;
            }
        };

        if filing.state != FilingState::EriInProgress {
            debug!(%filing_id, state = %filing.state, "filing not claimed for submission, skipping");
            return ProcessOutcome::Skipped;
        }

        let checksum = filing
            .checksum
            .clone()
            .unwrap_or_else(|| sha256::digest(&filing.payload));

        // Best-effort evidence that the external call began; losing this
        // record must not stop the submission.
        let started = AuditEvent::note(
            filing_id,
            FilingState::EriInProgress,
            SYSTEM_ACTOR,
            ActorRole::System,
            format!("eri call started checksum={checksum}"),
        );
        if let Err(e) = self.store.append_audit(&started) {
            warn!(%filing_id, error = %e, "failed to record call-start audit event");
        }

        info!(%filing_id, %checksum, "submitting filing to gateway");
        match self.gateway.submit(&filing.payload, &checksum) {
            Ok(receipt) => self.reconcile_success(filing_id, &receipt),
            Err(gateway_err) => self.reconcile_failure(filing_id, &gateway_err),
        }
    }

    /// Success path: `ERI_ACK_RECEIVED` then `FILED` in one fresh
    /// transaction so the pair is never observably separated. The filing is
    /// re-verified under the transaction; a racer that lost commits
    /// nothing.
    fn reconcile_success(&self, filing_id: &str, receipt: &SubmissionReceipt) -> ProcessOutcome {
        let result = self.store.update(filing_id, |filing| {
            if filing.state != FilingState::EriInProgress {
                return Ok(Commit::skip(ProcessOutcome::RaceLost));
            }

            filing.transition(FilingState::EriAckReceived)?;
            filing.transition(FilingState::Filed)?;
            filing.ack_number = Some(receipt.ack_number.clone());
            filing.filed_at = Some(TimeStamp::now());
            filing.rejection_reason = None;
            filing.failure = None;

            let events = vec![
                AuditEvent::transition(
                    filing_id,
                    FilingState::EriInProgress,
                    FilingState::EriAckReceived,
                    SYSTEM_ACTOR,
                    ActorRole::System,
                )
                .with_payload(receipt.to_evidence()),
                AuditEvent::transition(
                    filing_id,
                    FilingState::EriAckReceived,
                    FilingState::Filed,
                    SYSTEM_ACTOR,
                    ActorRole::System,
                ),
            ];
            Ok(Commit::persist(
                ProcessOutcome::Filed {
                    ack_number: receipt.ack_number.clone(),
                },
                events,
            ))
        });

        match result {
            Ok(outcome) => {
                match &outcome {
                    ProcessOutcome::Filed { ack_number } => {
                        info!(%filing_id, %ack_number, "filing successfully filed")
                    }
                    _ => debug!(%filing_id, "lost reconciliation race on success path"),
                }
                outcome
            }
            Err(e) => {
                // We hold an acknowledgment we could not persist; the
                // sweeper will recover it via check_status.
                error!(%filing_id, error = %e, "failed to persist successful submission");
                ProcessOutcome::Aborted
            }
        }
    }

    /// Failure path: record the classified failure and park the filing in
    /// `ERI_FAILED` for the recovery policy to look at.
    fn reconcile_failure(&self, filing_id: &str, gateway_err: &GatewayError) -> ProcessOutcome {
        let kind = FailureKind::from(gateway_err);
        let reason = gateway_err.to_string();

        let result = self.store.update(filing_id, |filing| {
            if filing.state != FilingState::EriInProgress {
                return Ok(Commit::skip(ProcessOutcome::RaceLost));
            }

            filing.transition(FilingState::EriFailed)?;
            filing.record_failure(kind.clone(), reason.clone());

            let event = AuditEvent::transition(
                filing_id,
                FilingState::EriInProgress,
                FilingState::EriFailed,
                SYSTEM_ACTOR,
                ActorRole::System,
            )
            .with_payload(reason.clone());
            Ok(Commit::persist(ProcessOutcome::Failed, vec![event]))
        });

        match result {
            Ok(outcome) => {
                match &outcome {
                    ProcessOutcome::Failed => {
                        warn!(%filing_id, %reason, "filing marked ERI_FAILED")
                    }
                    _ => debug!(%filing_id, "lost reconciliation race on failure path"),
                }
                outcome
            }
            Err(e) => {
                error!(%filing_id, error = %e, "failed to persist submission failure");
                ProcessOutcome::Aborted
            }
        }
    }
}
