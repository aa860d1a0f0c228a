//! The filing aggregate and its persisted attributes.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::LifecycleError;
use crate::policy::FailureKind;
use crate::state::{self, FilingState};
use crate::utils;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Age relative to `now`, saturating at zero for clock skew.
    pub fn age(&self, now: &TimeStamp<Utc>) -> std::time::Duration {
        (now.0 - self.0).to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// An information request raised by the reviewing CA against a filing.
/// An unresolved blocking request prevents submission for review.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct InfoRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub note: String,
    #[n(2)]
    pub blocking: bool,
    #[n(3)]
    pub resolved: bool,
}

impl InfoRequest {
    pub fn blocking(note: impl Into<String>) -> Self {
        Self {
            id: utils::new_uuid_to_bech32("req").unwrap_or_else(|_| "req_unknown".into()),
            note: note.into(),
            blocking: true,
            resolved: false,
        }
    }
}

/// Aggregate root tracked through the lifecycle. One record per id; the
/// `state` field is the canonical lifecycle state and doubles as the
/// concurrency token for worker/sweeper claims.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Filing {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, "filing1..."
    #[n(1)]
    pub owner_id: String,
    #[n(2)]
    pub firm_id: Option<String>, // set once a CA firm is engaged
    #[n(3)]
    pub state: FilingState,
    /// Opaque structured tax data, already CBOR; never interpreted here.
    #[n(4)]
    #[cbor(with = "minicbor::bytes")]
    pub payload: Vec<u8>,
    /// sha256 of the payload, fixed when the filing enters ERI_IN_PROGRESS.
    /// Also the reference handed to the gateway status check.
    #[n(5)]
    pub checksum: Option<String>,
    #[n(6)]
    pub ack_number: Option<String>,
    #[n(7)]
    pub filed_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub rejection_reason: Option<String>,
    #[n(9)]
    pub failure: Option<FailureKind>,
    #[n(10)]
    pub retry_count: u32,
    #[n(11)]
    pub info_requests: Vec<InfoRequest>,
    #[n(12)]
    pub created_at: TimeStamp<Utc>,
    #[n(13)]
    pub updated_at: TimeStamp<Utc>,
}

impl Filing {
    pub fn new_draft(
        owner_id: String,
        firm_id: Option<String>,
        payload: Vec<u8>,
    ) -> Result<Self, LifecycleError> {
        let id = utils::new_uuid_to_bech32("filing")
            .map_err(|e| LifecycleError::Codec(e.to_string()))?;
        let now = TimeStamp::now();
        Ok(Self {
            id,
            owner_id,
            firm_id,
            state: FilingState::Draft,
            payload,
            checksum: None,
            ack_number: None,
            filed_at: None,
            rejection_reason: None,
            failure: None,
            retry_count: 0,
            info_requests: vec![],
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Guarded in-memory transition. Does not persist; the caller wraps
    /// transition + audit + commit in one atomic unit.
    pub fn transition(&mut self, target: FilingState) -> Result<(), LifecycleError> {
        state::assert_transition(self.state, target)?;
        self.state = target;
        Ok(())
    }

    pub fn open_blocking_requests(&self) -> usize {
        self.info_requests
            .iter()
            .filter(|r| r.blocking && !r.resolved)
            .count()
    }

    /// Record a failure episode: human-readable reason for the UI plus the
    /// machine-readable kind the recovery selector matches on.
    pub fn record_failure(&mut self, kind: FailureKind, reason: impl Into<String>) {
        self.rejection_reason = Some(reason.into());
        self.failure = Some(kind);
    }

    /// Wipe everything belonging to the current submission episode so the
    /// filing can re-enter the pipeline from a clean point.
    pub fn reset_episode(&mut self) {
        self.checksum = None;
        self.ack_number = None;
        self.filed_at = None;
        self.rejection_reason = None;
        self.failure = None;
        self.retry_count = 0;
    }
}
