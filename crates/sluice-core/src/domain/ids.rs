//! Domain identifiers (strongly-typed IDs).
//!
//! - `RecordId`: store-assigned surrogate key of an outbox row (monotonic).
//! - `GroupKey`: logical partition/ordering key, bounded length.
//! - `PartitionId`: broker partition number.
//! - `MemberId` / `FlushBatchId`: ULID-based ids for log correlation.
//!
//! ULID-based ids share one generic `Id<T>` implementation; `T` is a
//! zero-sized marker that only exists at compile time, so a `MemberId` can
//! never be passed where a `FlushBatchId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;
use ulid::Ulid;

/// Maximum length (in characters) of a `GroupKey`.
pub const MAX_GROUP_KEY_LEN: usize = 56;

/// Surrogate key of an outbox record, assigned by the ledger on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupKeyError {
    #[error("group key must not be empty")]
    Empty,

    #[error("group key is {len} chars, max is {MAX_GROUP_KEY_LEN}")]
    TooLong { len: usize },
}

/// Grouping key of an outbox record.
///
/// Used for ordering within a group, as the broker message key, and as a
/// storage partitioning key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(s: impl Into<String>) -> Result<Self, GroupKeyError> {
        let s = s.into();
        if s.is_empty() {
            return Err(GroupKeyError::Empty);
        }
        let len = s.chars().count();
        if len > MAX_GROUP_KEY_LEN {
            return Err(GroupKeyError::TooLong { len });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GroupKey {
    type Error = GroupKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GroupKey> for String {
    fn from(key: GroupKey) -> Self {
        key.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Broker partition number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Marker trait for ULID-based ids. Provides the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-based id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Consumer-group member marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Member {}

impl IdMarker for Member {
    fn prefix() -> &'static str {
        "member-"
    }
}

/// Flush batch marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlushBatch {}

impl IdMarker for FlushBatch {
    fn prefix() -> &'static str {
        "flush-"
    }
}

/// Identifier of one consumer-group member (one worker instance).
pub type MemberId = Id<Member>;

/// Identifier of one coalescer flush (correlates the log lines of a flush).
pub type FlushBatchId = Id<FlushBatch>;
