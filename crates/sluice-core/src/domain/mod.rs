//! Domain model (ids, records, status fields, schema, errors).

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod record;
pub mod schema;
pub mod status;

pub use self::envelope::OutboxEnvelope;
pub use self::errors::{BrokerError, CoalescerError, DispatchError, ErrorKind, LedgerError};
pub use self::ids::{
    FlushBatchId, GroupKey, GroupKeyError, MemberId, PartitionId, RecordId, MAX_GROUP_KEY_LEN,
};
pub use self::record::{DispatchState, LifecycleError, NewOutboxRecord, OutboxRecord};
pub use self::schema::{AccessPath, IndexDescriptor, OUTBOX_TABLE};
pub use self::status::{StatusField, StatusUpdate};
