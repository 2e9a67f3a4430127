//! Outbox record: the unit of work and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{GroupKey, RecordId};
use super::status::StatusField;

/// Dispatch state of a record.
///
/// State transitions:
/// - Pending -> InFlight -> Produced
/// - Pending -> InFlight -> Pending (send failed, `retry_count` + 1)
///
/// `InFlight` only exists in the scheduler's memory. The store persists
/// `Pending` (`produced_at IS NULL`) and `Produced`, so a crash while a
/// record is in flight leaves it `Pending` and it is dispatched again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchState {
    /// Not yet attempted (or last attempt failed).
    Pending,
    /// Submitted to the broker pool, ack not yet observed.
    InFlight,
    /// Broker acknowledged; `produced_at` is persisted.
    Produced { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("{0} is already set")]
    AlreadySet(StatusField),

    #[error("{field} requires {requires} to be set first")]
    MissingPrerequisite {
        field: StatusField,
        requires: StatusField,
    },

    #[error("record is not pending dispatch")]
    NotPending,
}

/// Input written by the upstream transactional writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    pub group_key: GroupKey,
    pub payload_ref: String,
    pub rank: i64,
}

impl NewOutboxRecord {
    pub fn new(group_key: GroupKey, rank: i64, payload_ref: impl Into<String>) -> Self {
        Self {
            group_key,
            payload_ref: payload_ref.into(),
            rank,
        }
    }
}

/// A row of the outbox ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: RecordId,
    pub group_key: GroupKey,
    /// Opaque payload reference, owned by the upstream writer.
    pub payload_ref: String,
    pub rank: i64,
    pub dispatch: DispatchState,
    pub received_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn new(id: RecordId, input: NewOutboxRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            group_key: input.group_key,
            payload_ref: input.payload_ref,
            rank: input.rank,
            dispatch: DispatchState::Pending,
            received_at: None,
            processed_at: None,
            retry_count: 0,
            error_code: None,
            created_at,
        }
    }

    pub fn produced_at(&self) -> Option<DateTime<Utc>> {
        match self.dispatch {
            DispatchState::Produced { at } => Some(at),
            _ => None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// `max_retries` counts retries, not attempts: a record gets the first
    /// send plus `max_retries` more before it is out of budget.
    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count > max_retries
    }

    /// Retry budget exhausted; left for operator intervention.
    pub fn is_dead_lettered(&self, max_retries: u32) -> bool {
        self.produced_at().is_none() && self.retries_exhausted(max_retries)
    }

    /// Can the scheduler pick this record up?
    pub fn is_eligible(&self, max_retries: u32) -> bool {
        self.dispatch == DispatchState::Pending && !self.retries_exhausted(max_retries)
    }

    pub fn status(&self, field: StatusField) -> Option<DateTime<Utc>> {
        match field {
            StatusField::Produced => self.produced_at(),
            StatusField::Received => self.received_at,
            StatusField::Processed => self.processed_at,
        }
    }

    /// Pending -> InFlight.
    pub fn begin_dispatch(&mut self) -> Result<(), LifecycleError> {
        if self.dispatch != DispatchState::Pending {
            return Err(LifecycleError::NotPending);
        }
        self.dispatch = DispatchState::InFlight;
        Ok(())
    }

    /// Set a status field once, enforcing lifecycle order.
    pub fn apply(&mut self, field: StatusField, at: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.status(field).is_some() {
            return Err(LifecycleError::AlreadySet(field));
        }
        if let Some(requires) = field.prerequisite()
            && self.status(requires).is_none()
        {
            return Err(LifecycleError::MissingPrerequisite { field, requires });
        }
        match field {
            StatusField::Produced => {
                self.dispatch = DispatchState::Produced { at };
                self.error_code = None;
            }
            StatusField::Received => self.received_at = Some(at),
            StatusField::Processed => self.processed_at = Some(at),
        }
        Ok(())
    }

    pub fn mark_produced(&mut self, at: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.apply(StatusField::Produced, at)
    }

    pub fn mark_received(&mut self, at: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.apply(StatusField::Received, at)
    }

    pub fn mark_processed(&mut self, at: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.apply(StatusField::Processed, at)
    }

    /// A dispatch attempt failed: count it and keep the record pending.
    pub fn record_failure(&mut self, error_code: impl Into<String>) -> Result<u32, LifecycleError> {
        if self.produced_at().is_some() {
            return Err(LifecycleError::AlreadySet(StatusField::Produced));
        }
        self.dispatch = DispatchState::Pending;
        self.retry_count = self.retry_count.saturating_add(1);
        self.error_code = Some(error_code.into());
        Ok(self.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn record() -> OutboxRecord {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        OutboxRecord::new(
            RecordId::new(1),
            NewOutboxRecord::new(GroupKey::new("G1").unwrap(), 0, "order:1"),
            at,
        )
    }

    #[test]
    fn new_record_is_pending_and_eligible() {
        let r = record();
        assert_eq!(r.dispatch, DispatchState::Pending);
        assert!(r.is_eligible(5));
        assert!(!r.is_dead_lettered(5));
    }

    #[test]
    fn produced_is_set_at_most_once() {
        let mut r = record();
        let t1 = Utc::now();
        r.mark_produced(t1).unwrap();
        assert_eq!(r.produced_at(), Some(t1));

        let err = r.mark_produced(Utc::now()).unwrap_err();
        assert_eq!(err, LifecycleError::AlreadySet(StatusField::Produced));
        assert_eq!(r.produced_at(), Some(t1));
    }

    #[rstest]
    #[case::received_before_produced(StatusField::Received, StatusField::Produced)]
    #[case::processed_before_received(StatusField::Processed, StatusField::Received)]
    fn status_requires_prerequisite(#[case] field: StatusField, #[case] requires: StatusField) {
        let mut r = record();
        if field == StatusField::Processed {
            r.apply(StatusField::Produced, Utc::now()).unwrap();
        }
        let err = r.apply(field, Utc::now()).unwrap_err();
        assert_eq!(err, LifecycleError::MissingPrerequisite { field, requires });
    }

    #[test]
    fn failure_increments_retry_and_success_clears_error() {
        let mut r = record();
        r.begin_dispatch().unwrap();
        assert_eq!(r.record_failure("broker_connection").unwrap(), 1);
        assert_eq!(r.dispatch, DispatchState::Pending);
        assert_eq!(r.error_code.as_deref(), Some("broker_connection"));

        r.mark_produced(Utc::now()).unwrap();
        assert!(r.error_code.is_none());
        r.mark_received(Utc::now()).unwrap();
        r.mark_processed(Utc::now()).unwrap();
        assert!(r.is_processed());
        assert_eq!(r.retry_count, 1);
    }

    #[test]
    fn retry_cap_dead_letters_record() {
        let mut r = record();
        for _ in 0..3 {
            r.record_failure("broker_rejected").unwrap();
        }
        // three failures = first attempt plus two retries: one retry left
        assert!(r.is_eligible(3));
        assert!(!r.is_dead_lettered(3));

        r.record_failure("broker_rejected").unwrap();
        assert!(r.is_dead_lettered(3));
        assert!(!r.is_eligible(3));
        assert!(r.is_eligible(4));
    }

    #[test]
    fn begin_dispatch_only_from_pending() {
        let mut r = record();
        r.begin_dispatch().unwrap();
        assert_eq!(r.begin_dispatch().unwrap_err(), LifecycleError::NotPending);
    }
}
