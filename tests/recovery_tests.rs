//! Worker reconciliation, sweeper recovery and admin rescue behavior.
//!
//! These tests exercise the state-as-lease claim protocol directly: the
//! worker is invoked synchronously (no pool threads) wherever the test
//! needs to observe an intermediate state deterministically.

use std::sync::Arc;

use chrono::Utc;
use filing_lifecycle::{
    config::LifecycleConfig,
    error::{GatewayError, LifecycleError},
    filing::Filing,
    gateway::{EriGateway, GatewayStatus, StubGateway},
    policy::FailureKind,
    pool::SubmissionPool,
    rescue::AdminRescue,
    state::FilingState,
    store::FilingStore,
    sweeper::{RecoveryOutcome, RecoverySweeper},
    worker::{ProcessOutcome, SubmissionWorker},
};
use tempfile::tempdir;

struct Rig {
    _dir: tempfile::TempDir,
    store: FilingStore,
    gateway: Arc<StubGateway>,
    worker: Arc<SubmissionWorker>,
    pool: Arc<SubmissionPool>,
}

fn rig(name: &str) -> Rig {
    let dir = tempdir().unwrap();
    let db = sled::open(dir.path().join(format!("{name}.db"))).unwrap();
    let store = FilingStore::new(Arc::new(db));
    let gateway = Arc::new(StubGateway::new());
    let worker = Arc::new(SubmissionWorker::new(
        store.clone(),
        gateway.clone() as Arc<dyn EriGateway>,
    ));
    let pool = Arc::new(SubmissionPool::start(worker.clone(), 1, 8));
    Rig {
        _dir: dir,
        store,
        gateway,
        worker,
        pool,
    }
}

fn sweeper(rig: &Rig) -> RecoverySweeper {
    RecoverySweeper::new(
        rig.store.clone(),
        rig.gateway.clone() as Arc<dyn EriGateway>,
        rig.pool.clone(),
        LifecycleConfig::default(),
    )
}

/// A filing parked in ERI_IN_PROGRESS whose last update is old enough to
/// count as stuck under the default staleness threshold.
fn stuck_filing(store: &FilingStore, retry_count: u32, failure: Option<FailureKind>) -> Filing {
    let mut filing = Filing::new_draft("user1owner".into(), None, vec![0xC4]).unwrap();
    filing.state = FilingState::EriInProgress;
    filing.checksum = Some("c4deadbeef".into());
    filing.retry_count = retry_count;
    filing.failure = failure;
    filing.updated_at = (Utc::now() - chrono::TimeDelta::hours(2)).into();
    store.put(&filing).unwrap();
    filing
}

fn claimed_filing(store: &FilingStore) -> Filing {
    let mut filing = Filing::new_draft("user1owner".into(), None, vec![0xC4]).unwrap();
    filing.state = FilingState::EriInProgress;
    filing.checksum = Some("c4deadbeef".into());
    store.put(&filing).unwrap();
    filing
}

#[test]
fn worker_skips_unclaimed_filing() {
    let r = rig("worker_skips");
    let filing = Filing::new_draft("user1owner".into(), None, vec![1]).unwrap();
    r.store.put(&filing).unwrap();

    let outcome = r.worker.process_submission(&filing.id);
    assert_eq!(outcome, ProcessOutcome::Skipped);

    // untouched: no state change, no audit write, no gateway call
    assert_eq!(r.store.load(&filing.id).unwrap(), filing);
    assert!(r.store.audit_trail(&filing.id).unwrap().is_empty());
    assert_eq!(r.gateway.submit_calls(), 0);
    r.pool.shutdown();
}

#[test]
fn worker_tolerates_unknown_filing() {
    let r = rig("worker_unknown");
    assert_eq!(
        r.worker.process_submission("filing1doesnotexist"),
        ProcessOutcome::Skipped
    );
    r.pool.shutdown();
}

#[test]
fn worker_success_is_atomic_and_write_once() {
    let r = rig("worker_success");
    let filing = claimed_filing(&r.store);
    r.gateway.push_submit(Ok(StubGateway::receipt("ACK-77")));

    let outcome = r.worker.process_submission(&filing.id);
    assert_eq!(
        outcome,
        ProcessOutcome::Filed {
            ack_number: "ACK-77".into()
        }
    );

    let filed = r.store.load(&filing.id).unwrap();
    assert_eq!(filed.state, FilingState::Filed);
    assert_eq!(filed.ack_number.as_deref(), Some("ACK-77"));
    assert!(filed.filed_at.is_some());

    // second invocation is a race-free no-op: already terminal
    assert_eq!(
        r.worker.process_submission(&filing.id),
        ProcessOutcome::Skipped
    );
    assert_eq!(r.store.load(&filing.id).unwrap().ack_number.as_deref(), Some("ACK-77"));
    r.pool.shutdown();
}

#[test]
fn concurrent_workers_produce_exactly_one_terminal_transition() {
    let r = rig("worker_race");
    let filing = claimed_filing(&r.store);
    r.gateway.push_submit(Ok(StubGateway::receipt("ACK-RACE-A")));
    r.gateway.push_submit(Ok(StubGateway::receipt("ACK-RACE-B")));

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let mut threads = Vec::new();
    for _ in 0..2 {
        let worker = r.worker.clone();
        let id = filing.id.clone();
        let barrier = barrier.clone();
        threads.push(std::thread::spawn(move || {
            barrier.wait();
            worker.process_submission(&id)
        }));
    }
    let outcomes: Vec<ProcessOutcome> =
        threads.into_iter().map(|t| t.join().unwrap()).collect();

    let wins = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Filed { .. }))
        .count();
    assert_eq!(wins, 1, "exactly one worker may reconcile: {outcomes:?}");

    let filed = r.store.load(&filing.id).unwrap();
    assert_eq!(filed.state, FilingState::Filed);
    let ack = filed.ack_number.expect("ack must be set");
    assert!(ack == "ACK-RACE-A" || ack == "ACK-RACE-B");

    // one acknowledgment pair in the trail, never two
    let trail = r.store.audit_trail(&filing.id).unwrap();
    let ack_transitions = trail
        .iter()
        .filter(|e| e.is_state_change() && e.to == FilingState::EriAckReceived)
        .count();
    let filed_transitions = trail
        .iter()
        .filter(|e| e.is_state_change() && e.to == FilingState::Filed)
        .count();
    assert_eq!((ack_transitions, filed_transitions), (1, 1));
    r.pool.shutdown();
}

#[test]
fn worker_failure_records_classification() {
    let r = rig("worker_failure");
    let filing = claimed_filing(&r.store);
    r.gateway
        .push_submit(Err(GatewayError::AuthFailed("certificate expired".into())));

    assert_eq!(r.worker.process_submission(&filing.id), ProcessOutcome::Failed);

    let failed = r.store.load(&filing.id).unwrap();
    assert_eq!(failed.state, FilingState::EriFailed);
    assert_eq!(
        failed.failure,
        Some(FailureKind::AuthFailed {
            detail: "certificate expired".into()
        })
    );
    assert!(failed.rejection_reason.unwrap().contains("certificate expired"));
    r.pool.shutdown();
}

#[test]
fn failed_filing_recovers_immediately_by_policy() {
    let r = rig("recover_failed");
    r.pool.shutdown();

    // a transient episode the worker already parked in ERI_FAILED
    let filing = claimed_filing(&r.store);
    r.gateway
        .push_submit(Err(GatewayError::Transient("ETIMEDOUT".into())));
    assert_eq!(r.worker.process_submission(&filing.id), ProcessOutcome::Failed);

    let sw = sweeper(&r);
    assert_eq!(
        sw.recover_failed(&filing.id).unwrap(),
        RecoveryOutcome::Retried { attempt: 1 }
    );
    let retried = r.store.load(&filing.id).unwrap();
    assert_eq!(retried.state, FilingState::EriInProgress);
    assert_eq!(retried.retry_count, 1);

    // rejection episodes escalate to the user instead
    let rejected = claimed_filing(&r.store);
    r.gateway
        .push_submit(Err(GatewayError::Rejected("bad schedule CG".into())));
    assert_eq!(r.worker.process_submission(&rejected.id), ProcessOutcome::Failed);
    assert_eq!(
        sw.recover_failed(&rejected.id).unwrap(),
        RecoveryOutcome::Escalated {
            target: FilingState::ActionRequired
        }
    );
    assert_eq!(
        r.store.load(&rejected.id).unwrap().state,
        FilingState::ActionRequired
    );
}

#[test]
fn sweeper_retries_transient_stuck_filing() {
    let r = rig("sweep_retry");
    // shut the pool first so the re-dispatch is declined and the
    // post-retry state stays observable
    r.pool.shutdown();

    let filing = stuck_filing(
        &r.store,
        0,
        Some(FailureKind::Transient {
            detail: "ETIMEDOUT".into(),
        }),
    );

    let report = sweeper(&r).sweep().unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.retried, 1);

    let retried = r.store.load(&filing.id).unwrap();
    assert_eq!(retried.state, FilingState::EriInProgress);
    assert_eq!(retried.retry_count, 1);

    // the retry is recorded through the legal ERI_FAILED edge
    let trail = r.store.audit_trail(&filing.id).unwrap();
    let hops: Vec<(FilingState, FilingState)> = trail
        .iter()
        .filter(|e| e.is_state_change())
        .map(|e| (e.from, e.to))
        .collect();
    assert_eq!(
        hops,
        vec![
            (FilingState::EriInProgress, FilingState::EriFailed),
            (FilingState::EriFailed, FilingState::EriInProgress),
        ]
    );
}

#[test]
fn sweeper_exhausts_transient_retries() {
    let r = rig("sweep_exhaust");
    r.pool.shutdown();

    let filing = stuck_filing(
        &r.store,
        3, // MAX_TRANSIENT_RETRIES already spent
        Some(FailureKind::Transient {
            detail: "ETIMEDOUT".into(),
        }),
    );

    let report = sweeper(&r).sweep().unwrap();
    assert_eq!(report.escalated, 1);

    let parked = r.store.load(&filing.id).unwrap();
    assert_eq!(parked.state, FilingState::EriFailed);
    assert_eq!(parked.rejection_reason.as_deref(), Some("retries exhausted"));
    assert_eq!(parked.retry_count, 3);

    // a second sweep finds nothing: the filing is out of ERI_IN_PROGRESS
    let again = sweeper(&r).sweep().unwrap();
    assert_eq!(again.examined, 0);
}

#[test]
fn sweeper_recovers_lost_acknowledgment() {
    let r = rig("sweep_lost_ack");
    r.pool.shutdown();

    let filing = stuck_filing(&r.store, 0, None);
    r.gateway.push_status(Ok(GatewayStatus::Accepted {
        ack_number: "ACK-REC-77".into(),
    }));

    let report = sweeper(&r).sweep().unwrap();
    assert_eq!(report.recovered, 1);

    let filed = r.store.load(&filing.id).unwrap();
    assert_eq!(filed.state, FilingState::Filed);
    assert_eq!(filed.ack_number.as_deref(), Some("ACK-REC-77"));
    // recovered without ever re-submitting
    assert_eq!(r.gateway.submit_calls(), 0);

    let trail = r.store.audit_trail(&filing.id).unwrap();
    assert!(trail.iter().any(|e| e.actor_id == "SYSTEM_RECOVERY"));
}

#[test]
fn sweeper_escalates_remote_rejection() {
    let r = rig("sweep_rejected");
    r.pool.shutdown();

    let filing = stuck_filing(&r.store, 0, None);
    r.gateway.push_status(Ok(GatewayStatus::Rejected {
        reason: "schema validation failed".into(),
    }));

    let report = sweeper(&r).sweep().unwrap();
    assert_eq!(report.escalated, 1);

    let escalated = r.store.load(&filing.id).unwrap();
    assert_eq!(escalated.state, FilingState::ActionRequired);
    assert!(
        escalated
            .rejection_reason
            .unwrap()
            .contains("schema validation failed")
    );
}

#[test]
fn sweeper_leaves_pending_submissions_alone() {
    let r = rig("sweep_pending");
    r.pool.shutdown();

    let filing = stuck_filing(&r.store, 0, None);
    r.gateway.push_status(Ok(GatewayStatus::Pending));

    let report = sweeper(&r).sweep().unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(r.store.load(&filing.id).unwrap().state, FilingState::EriInProgress);
}

#[test]
fn sweeper_honors_backoff_schedule() {
    let r = rig("sweep_backoff");
    r.pool.shutdown();

    // idle well short of the due time for attempt 2 (600s threshold plus
    // the backoff delay): recovery declines to retry yet
    let mut filing = stuck_filing(
        &r.store,
        1,
        Some(FailureKind::Transient {
            detail: "ECONNRESET".into(),
        }),
    );
    filing.updated_at = (Utc::now() - chrono::TimeDelta::seconds(300)).into();
    r.store.put(&filing).unwrap();

    let sw = sweeper(&r);
    assert_eq!(sw.recover(&filing.id).unwrap(), RecoveryOutcome::Skipped);
    assert_eq!(r.store.load(&filing.id).unwrap().retry_count, 1);

    // well past the delay: retried
    filing.updated_at = (Utc::now() - chrono::TimeDelta::hours(1)).into();
    r.store.put(&filing).unwrap();
    assert_eq!(
        sw.recover(&filing.id).unwrap(),
        RecoveryOutcome::Retried { attempt: 2 }
    );
}

#[test]
fn sweeper_ignores_unstuck_filing() {
    let r = rig("sweep_unstuck");
    r.pool.shutdown();

    let filing = Filing::new_draft("user1owner".into(), None, vec![]).unwrap();
    r.store.put(&filing).unwrap();
    assert_eq!(
        sweeper(&r).recover(&filing.id).unwrap(),
        RecoveryOutcome::Skipped
    );
}

#[test]
fn admin_rescue_roundtrip() {
    let r = rig("rescue_roundtrip");
    let filing = claimed_filing(&r.store);
    let rescue = AdminRescue::new(r.store.clone());

    let failed = rescue
        .force_fail(&filing.id, "gateway wedged, operator intervention", "admin1root")
        .unwrap();
    assert_eq!(failed.state, FilingState::EriFailed);
    assert!(failed.rejection_reason.unwrap().contains("operator intervention"));

    let clean = rescue.force_retry(&filing.id, "admin1root").unwrap();
    assert_eq!(clean.state, FilingState::CaApproved);
    assert_eq!(clean.retry_count, 0);
    assert!(clean.ack_number.is_none());
    assert!(clean.rejection_reason.is_none());
    assert!(clean.failure.is_none());
    assert!(clean.checksum.is_none());

    // both interventions are in the audit trail with role ADMIN
    let trail = r.store.audit_trail(&filing.id).unwrap();
    let admin_events = trail
        .iter()
        .filter(|e| e.actor_id == "admin1root")
        .count();
    assert_eq!(admin_events, 2);
    r.pool.shutdown();
}

#[test]
fn force_fail_rejected_outside_submission() {
    let r = rig("rescue_guarded");
    let filing = Filing::new_draft("user1owner".into(), None, vec![]).unwrap();
    r.store.put(&filing).unwrap();

    let err = AdminRescue::new(r.store.clone())
        .force_fail(&filing.id, "nope", "admin1root")
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    assert_eq!(r.store.load(&filing.id).unwrap().state, FilingState::Draft);
    r.pool.shutdown();
}
