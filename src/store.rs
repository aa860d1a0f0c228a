//! sled-backed persistence for filings and their audit trails.
//!
//! All state changes go through [`FilingStore::update`], which re-reads the
//! filing inside a sled transaction and commits the mutated record together
//! with its audit events atomically. The persisted state field is the
//! mutual-exclusion token: a worker or sweeper claims a filing by observing
//! the expected pre-state inside the transaction, and of two racers exactly
//! one does.

use std::sync::Arc;
use std::time::Duration;

use sled::Db;
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::audit::AuditEvent;
use crate::error::LifecycleError;
use crate::filing::{Filing, TimeStamp};
use crate::state::FilingState;

const FILING_PREFIX: &str = "filing/";
const AUDIT_PREFIX: &str = "audit/";

fn filing_key(id: &str) -> String {
    format!("{FILING_PREFIX}{id}")
}

// zero-padded so lexicographic key order is append order
fn audit_key(filing_id: &str, seq: u64) -> String {
    format!("{AUDIT_PREFIX}{filing_id}/{seq:020}")
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, LifecycleError> {
    minicbor::to_vec(value).map_err(|e| LifecycleError::Codec(e.to_string()))
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> Result<T, LifecycleError> {
    minicbor::decode(bytes).map_err(|e| LifecycleError::Codec(e.to_string()))
}

fn abort(e: LifecycleError) -> ConflictableTransactionError<LifecycleError> {
    ConflictableTransactionError::Abort(e)
}

/// What a transactional update wants committed.
pub struct Commit<T> {
    pub value: T,
    pub events: Vec<AuditEvent>,
    pub persist: bool,
}

impl<T> Commit<T> {
    /// Persist the mutated filing along with the given audit events.
    pub fn persist(value: T, events: Vec<AuditEvent>) -> Self {
        Self {
            value,
            events,
            persist: true,
        }
    }

    /// Commit nothing; used by race losers that observed an unexpected
    /// pre-state and must leave the record untouched.
    pub fn skip(value: T) -> Self {
        Self {
            value,
            events: vec![],
            persist: false,
        }
    }
}

#[derive(Clone)]
pub struct FilingStore {
    db: Arc<Db>,
}

impl FilingStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn try_load(&self, id: &str) -> Result<Option<Filing>, LifecycleError> {
        match self.db.get(filing_key(id).as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load(&self, id: &str) -> Result<Filing, LifecycleError> {
        self.try_load(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    /// Unconditional write. Does not touch `updated_at`; transactional
    /// updates do. Used for inserts and test fixtures.
    pub fn put(&self, filing: &Filing) -> Result<(), LifecycleError> {
        self.db
            .insert(filing_key(&filing.id).as_bytes(), encode(filing)?)?;
        Ok(())
    }

    /// Run `f` against the current filing record inside a sled transaction
    /// and commit the mutated filing plus the returned audit events as one
    /// atomic unit. The closure may run more than once on conflict.
    pub fn update<T, F>(&self, id: &str, f: F) -> Result<T, LifecycleError>
    where
        F: Fn(&mut Filing) -> Result<Commit<T>, LifecycleError>,
    {
        let key = filing_key(id);
        let result = self.db.transaction(|tx| {
            let bytes = tx
                .get(key.as_bytes())?
                .ok_or_else(|| abort(LifecycleError::NotFound(id.to_string())))?;
            let mut filing: Filing = decode(&bytes).map_err(abort)?;

            let commit = f(&mut filing).map_err(abort)?;

            if commit.persist {
                filing.updated_at = TimeStamp::now();
                tx.insert(key.as_bytes(), encode(&filing).map_err(abort)?)?;
            }
            for event in &commit.events {
                let seq = tx
                    .generate_id()
                    .map_err(|e| abort(LifecycleError::Storage(e)))?;
                tx.insert(
                    audit_key(&event.filing_id, seq).as_bytes(),
                    encode(event).map_err(abort)?,
                )?;
            }
            Ok(commit.value)
        });

        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(LifecycleError::Storage(e)),
        }
    }

    /// Best-effort single audit write outside any transaction. Callers
    /// tolerate loss; ordering is recovered via the event timestamp.
    pub fn append_audit(&self, event: &AuditEvent) -> Result<(), LifecycleError> {
        let seq = self.db.generate_id()?;
        self.db
            .insert(audit_key(&event.filing_id, seq).as_bytes(), encode(event)?)?;
        Ok(())
    }

    /// Full audit trail for a filing, ordered by event timestamp.
    pub fn audit_trail(&self, id: &str) -> Result<Vec<AuditEvent>, LifecycleError> {
        let prefix = format!("{AUDIT_PREFIX}{id}/");
        let mut events = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry?;
            events.push(decode::<AuditEvent>(&bytes)?);
        }
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(events)
    }

    /// Filings sitting in `ERI_IN_PROGRESS` whose last update is older than
    /// the staleness threshold: a crashed worker or a lost callback.
    pub fn stuck_filings(&self, older_than: Duration) -> Result<Vec<Filing>, LifecycleError> {
        let now = TimeStamp::now();
        let mut stuck = Vec::new();
        for entry in self.db.scan_prefix(FILING_PREFIX.as_bytes()) {
            let (_, bytes) = entry?;
            let filing: Filing = decode(&bytes)?;
            if filing.state == FilingState::EriInProgress
                && filing.updated_at.age(&now) >= older_than
            {
                stuck.push(filing);
            }
        }
        Ok(stuck)
    }
}
