//! Status fields written through the coalescer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::RecordId;
use super::schema::{self, ColumnDescriptor};

/// A lifecycle status column that is set once per record.
///
/// Declared in lifecycle order: a field may only be set after its
/// prerequisite is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusField {
    /// Broker acknowledged the send (`produced_at`).
    Produced,
    /// Consumer side observed the record (`received_at`).
    Received,
    /// Consumer finished its side effects (`processed_at`).
    Processed,
}

impl StatusField {
    /// All fields, in the order a flush must write them.
    pub const LIFECYCLE: [StatusField; 3] = [
        StatusField::Produced,
        StatusField::Received,
        StatusField::Processed,
    ];

    /// The field that must already be set before this one may be written.
    pub fn prerequisite(self) -> Option<StatusField> {
        match self {
            StatusField::Produced => None,
            StatusField::Received => Some(StatusField::Produced),
            StatusField::Processed => Some(StatusField::Received),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusField::Produced => "produced",
            StatusField::Received => "received",
            StatusField::Processed => "processed",
        }
    }

    /// Column descriptor backing this field.
    pub fn column(self) -> &'static ColumnDescriptor {
        match self {
            StatusField::Produced => &schema::PRODUCED_AT,
            StatusField::Received => &schema::RECEIVED_AT,
            StatusField::Processed => &schema::PROCESSED_AT,
        }
    }
}

impl fmt::Display for StatusField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One "mark this id's status" request.
///
/// `observed_at` is when the caller saw the event (broker ack, consumer
/// receive). The value written to the store is the flush timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: RecordId,
    pub field: StatusField,
    pub observed_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(id: RecordId, field: StatusField, observed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            field,
            observed_at,
        }
    }
}
