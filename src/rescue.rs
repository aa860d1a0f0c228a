//! Manual operator overrides for wedged submissions.
//!
//! Both operations still go through the transition guard, so an operator
//! cannot produce a state the registry does not know about. Every call is
//! audited with role ADMIN.

use tracing::info;

use crate::audit::{ActorRole, AuditEvent};
use crate::error::LifecycleError;
use crate::filing::Filing;
use crate::policy::FailureKind;
use crate::state::FilingState;
use crate::store::{Commit, FilingStore};

pub struct AdminRescue {
    store: FilingStore,
}

impl AdminRescue {
    pub fn new(store: FilingStore) -> Self {
        Self { store }
    }

    /// Force a filing out of `ERI_IN_PROGRESS` into `ERI_FAILED` with an
    /// operator-supplied reason.
    pub fn force_fail(
        &self,
        filing_id: &str,
        reason: &str,
        admin_id: &str,
    ) -> Result<Filing, LifecycleError> {
        let filing = self.store.update(filing_id, |filing| {
            let prior = filing.state;
            filing.transition(FilingState::EriFailed)?;
            filing.record_failure(
                FailureKind::Unknown {
                    detail: reason.to_string(),
                },
                reason,
            );
            let event = AuditEvent::transition(
                filing_id,
                prior,
                FilingState::EriFailed,
                admin_id,
                ActorRole::Admin,
            )
            .with_payload(format!("force-failed by operator: {reason}"));
            Ok(Commit::persist(filing.clone(), vec![event]))
        })?;
        info!(%filing_id, %admin_id, %reason, "filing force-failed");
        Ok(filing)
    }

    /// Send a failed filing back to `CA_APPROVED` with a clean episode so
    /// it can re-enter the pipeline.
    pub fn force_retry(&self, filing_id: &str, admin_id: &str) -> Result<Filing, LifecycleError> {
        let filing = self.store.update(filing_id, |filing| {
            let prior = filing.state;
            filing.transition(FilingState::CaApproved)?;
            filing.reset_episode();
            let event = AuditEvent::transition(
                filing_id,
                prior,
                FilingState::CaApproved,
                admin_id,
                ActorRole::Admin,
            )
            .with_payload("force-retried by operator, episode reset");
            Ok(Commit::persist(filing.clone(), vec![event]))
        })?;
        info!(%filing_id, %admin_id, "filing force-retried");
        Ok(filing)
    }
}
