//! User- and CA-facing operations that drive a filing through review and
//! hand it off to the submission pool.
//!
//! Every operation is one guarded transition + audit + commit inside a
//! single transaction; the only thing that happens outside a transaction
//! is the non-blocking dispatch after `approve_and_submit` commits.

use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::{ActorRole, AuditEvent, SYSTEM_ACTOR};
use crate::error::LifecycleError;
use crate::filing::{Filing, InfoRequest};
use crate::pool::SubmissionPool;
use crate::state::FilingState;
use crate::store::{Commit, FilingStore};

/// Identity of the reviewing professional acting on a filing.
#[derive(Debug, Clone)]
pub struct ReviewerContext {
    pub ca_id: String,
    pub firm_id: String,
}

/// What the HTTP layer reflects back to the caller after a submission is
/// initiated: the committed state and (not yet) an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub status: FilingState,
    pub ack_number: Option<String>,
}

pub struct ApprovalService {
    store: FilingStore,
    pool: Arc<SubmissionPool>,
}

impl ApprovalService {
    pub fn new(store: FilingStore, pool: Arc<SubmissionPool>) -> Self {
        Self { store, pool }
    }

    pub fn create_draft(
        &self,
        owner_id: String,
        firm_id: Option<String>,
        payload: Vec<u8>,
    ) -> Result<Filing, LifecycleError> {
        let filing = Filing::new_draft(owner_id, firm_id, payload)?;
        self.store.put(&filing)?;
        self.store.append_audit(
            &AuditEvent::note(
                &filing.id,
                FilingState::Draft,
                &filing.owner_id,
                ActorRole::EndUser,
                "filing created",
            ),
        )?;
        info!(filing_id = %filing.id, owner = %filing.owner_id, "draft created");
        Ok(filing)
    }

    /// Replace the draft payload. A `DRAFT -> DRAFT` self-loop, so repeated
    /// saves are idempotent against the guard.
    pub fn save_draft(
        &self,
        filing_id: &str,
        user_id: &str,
        payload: Vec<u8>,
    ) -> Result<Filing, LifecycleError> {
        self.store.update(filing_id, |filing| {
            Self::require_owner(filing, user_id)?;
            filing.transition(FilingState::Draft)?;
            filing.payload = payload.clone();
            let event = AuditEvent::transition(
                filing_id,
                FilingState::Draft,
                FilingState::Draft,
                user_id,
                ActorRole::EndUser,
            )
            .with_payload("draft saved");
            Ok(Commit::persist(filing.clone(), vec![event]))
        })
    }

    pub fn mark_ready(&self, filing_id: &str, user_id: &str) -> Result<Filing, LifecycleError> {
        self.simple_owner_transition(filing_id, user_id, FilingState::ReadyToFile)
    }

    pub fn return_to_draft(
        &self,
        filing_id: &str,
        user_id: &str,
    ) -> Result<Filing, LifecycleError> {
        self.simple_owner_transition(filing_id, user_id, FilingState::Draft)
    }

    /// Hand the filing to the reviewing CA. Refused while any unresolved
    /// blocking information request is open.
    pub fn submit_to_review(
        &self,
        filing_id: &str,
        user_id: &str,
    ) -> Result<Filing, LifecycleError> {
        let filing = self.store.update(filing_id, |filing| {
            Self::require_owner(filing, user_id)?;
            let open = filing.open_blocking_requests();
            if open > 0 {
                return Err(LifecycleError::BlockingRequestsPending { open });
            }
            let prior = filing.state;
            filing.transition(FilingState::SubmittedToCa)?;
            let event = AuditEvent::transition(
                filing_id,
                prior,
                FilingState::SubmittedToCa,
                user_id,
                ActorRole::EndUser,
            );
            Ok(Commit::persist(filing.clone(), vec![event]))
        })?;
        info!(%filing_id, "filing submitted for CA review");
        Ok(filing)
    }

    /// CA sends the filing back to the user with a blocking request.
    pub fn request_changes(
        &self,
        filing_id: &str,
        reviewer: &ReviewerContext,
        note: &str,
    ) -> Result<Filing, LifecycleError> {
        self.store.update(filing_id, |filing| {
            Self::require_firm(filing, reviewer)?;
            let prior = filing.state;
            filing.transition(FilingState::ActionRequired)?;
            filing.info_requests.push(InfoRequest::blocking(note));
            let event = AuditEvent::transition(
                filing_id,
                prior,
                FilingState::ActionRequired,
                &reviewer.ca_id,
                ActorRole::Ca,
            )
            .with_payload(note.to_string());
            Ok(Commit::persist(filing.clone(), vec![event]))
        })
    }

    pub fn resolve_request(
        &self,
        filing_id: &str,
        user_id: &str,
        request_id: &str,
    ) -> Result<Filing, LifecycleError> {
        self.store.update(filing_id, |filing| {
            Self::require_owner(filing, user_id)?;
            let Some(request) = filing
                .info_requests
                .iter_mut()
                .find(|r| r.id == request_id)
            else {
                return Err(LifecycleError::NotFound(request_id.to_string()));
            };
            request.resolved = true;
            let event = AuditEvent::note(
                filing_id,
                filing.state,
                user_id,
                ActorRole::EndUser,
                format!("info request {request_id} resolved"),
            );
            Ok(Commit::persist(filing.clone(), vec![event]))
        })
    }

    /// Back into review once every blocking request is resolved.
    pub fn resubmit(&self, filing_id: &str, user_id: &str) -> Result<Filing, LifecycleError> {
        self.store.update(filing_id, |filing| {
            Self::require_owner(filing, user_id)?;
            let open = filing.open_blocking_requests();
            if open > 0 {
                return Err(LifecycleError::BlockingRequestsPending { open });
            }
            let prior = filing.state;
            filing.transition(FilingState::SubmittedToCa)?;
            let event = AuditEvent::transition(
                filing_id,
                prior,
                FilingState::SubmittedToCa,
                user_id,
                ActorRole::EndUser,
            );
            Ok(Commit::persist(filing.clone(), vec![event]))
        })
    }

    pub fn cancel(&self, filing_id: &str, user_id: &str) -> Result<Filing, LifecycleError> {
        self.simple_owner_transition(filing_id, user_id, FilingState::Cancelled)
    }

    /// Reset a cancelled filing to a clean draft.
    pub fn reopen(&self, filing_id: &str, user_id: &str) -> Result<Filing, LifecycleError> {
        self.store.update(filing_id, |filing| {
            Self::require_owner(filing, user_id)?;
            let prior = filing.state;
            filing.transition(FilingState::Draft)?;
            filing.reset_episode();
            let event = AuditEvent::transition(
                filing_id,
                prior,
                FilingState::Draft,
                user_id,
                ActorRole::EndUser,
            )
            .with_payload("filing reopened");
            Ok(Commit::persist(filing.clone(), vec![event]))
        })
    }

    /// CA approval and submission hand-off.
    ///
    /// Both transitions (`-> CA_APPROVED`, `-> ERI_IN_PROGRESS`) commit in
    /// one transaction so a crash between them cannot be observed. The
    /// gateway call itself happens on a pool thread after the commit; this
    /// method returns immediately with no acknowledgment number.
    pub fn approve_and_submit(
        &self,
        filing_id: &str,
        reviewer: &ReviewerContext,
    ) -> Result<SubmissionOutcome, LifecycleError> {
        let outcome = self.store.update(filing_id, |filing| {
            Self::require_firm(filing, reviewer)?;

            let prior = filing.state;
            filing.transition(FilingState::CaApproved)?;
            filing.transition(FilingState::EriInProgress)?;

            // Fresh episode: fix the checksum the gateway will be asked
            // about and clear leftovers from any previous attempt.
            filing.checksum = Some(sha256::digest(&filing.payload));
            filing.rejection_reason = None;
            filing.failure = None;

            let events = vec![
                AuditEvent::transition(
                    filing_id,
                    prior,
                    FilingState::CaApproved,
                    &reviewer.ca_id,
                    ActorRole::Ca,
                ),
                AuditEvent::transition(
                    filing_id,
                    FilingState::CaApproved,
                    FilingState::EriInProgress,
                    SYSTEM_ACTOR,
                    ActorRole::System,
                ),
            ];
            Ok(Commit::persist(
                SubmissionOutcome {
                    status: FilingState::EriInProgress,
                    ack_number: None,
                },
                events,
            ))
        })?;

        // Commit-then-dispatch: the pool must only ever see committed
        // state, and the request thread never waits on the gateway.
        if !self.pool.dispatch(filing_id) {
            warn!(%filing_id, "dispatch declined, sweeper will recover");
        }
        info!(%filing_id, "submission initiated");
        Ok(outcome)
    }

    fn require_owner(filing: &Filing, user_id: &str) -> Result<(), LifecycleError> {
        if filing.owner_id != user_id {
            return Err(LifecycleError::AccessDenied {
                actor: user_id.to_string(),
            });
        }
        Ok(())
    }

    fn require_firm(filing: &Filing, reviewer: &ReviewerContext) -> Result<(), LifecycleError> {
        if let Some(firm) = &filing.firm_id {
            if *firm != reviewer.firm_id {
                return Err(LifecycleError::AccessDenied {
                    actor: reviewer.ca_id.clone(),
                });
            }
        }
        Ok(())
    }

    fn simple_owner_transition(
        &self,
        filing_id: &str,
        user_id: &str,
        target: FilingState,
    ) -> Result<Filing, LifecycleError> {
        self.store.update(filing_id, |filing| {
            Self::require_owner(filing, user_id)?;
            let prior = filing.state;
            filing.transition(target)?;
            let event =
                AuditEvent::transition(filing_id, prior, target, user_id, ActorRole::EndUser);
            Ok(Commit::persist(filing.clone(), vec![event]))
        })
    }
}
