//! OutboxEnvelope - what travels through the broker.
//!
//! The payload itself stays opaque (`payload_ref`); the envelope only adds
//! the fields a consumer needs to report status back.

use serde::{Deserialize, Serialize};

use super::ids::{GroupKey, RecordId};
use super::record::OutboxRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub record_id: RecordId,
    pub group_key: GroupKey,
    pub rank: i64,
    pub payload_ref: String,
}

impl OutboxEnvelope {
    pub fn from_record(record: &OutboxRecord) -> Self {
        Self {
            record_id: record.id,
            group_key: record.group_key.clone(),
            rank: record.rank,
            payload_ref: record.payload_ref.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewOutboxRecord;
    use chrono::Utc;

    #[test]
    fn envelope_carries_record_identity() {
        let record = OutboxRecord::new(
            RecordId::new(42),
            NewOutboxRecord::new(GroupKey::new("G7").unwrap(), 3, "invoice:9"),
            Utc::now(),
        );
        let bytes = OutboxEnvelope::from_record(&record).to_bytes().unwrap();
        let decoded = OutboxEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.record_id, RecordId::new(42));
        assert_eq!(decoded.group_key.as_str(), "G7");
        assert_eq!(decoded.rank, 3);
        assert_eq!(decoded.payload_ref, "invoice:9");
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(OutboxEnvelope::from_bytes(b"not json").is_err());
    }
}
