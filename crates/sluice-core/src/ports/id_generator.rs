//! IdGenerator port - ID 生成の抽象化
//!
//! Record ids are assigned by the ledger; this port only covers the ULID
//! ids the dispatcher mints itself (consumer members, flush batches).

use crate::domain::{FlushBatchId, MemberId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    /// Consumer-group member id (one per consumer instance).
    fn generate_member_id(&self) -> MemberId;

    /// Flush batch id, used to correlate a flush's log lines.
    fn generate_flush_batch_id(&self) -> FlushBatchId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Timestamp part comes from the Clock, so a FixedClock gives ids with a
/// fixed timestamp (the random part still differs).
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_member_id(&self) -> MemberId {
        MemberId::from(self.next_ulid())
    }

    fn generate_flush_batch_id(&self) -> FlushBatchId {
        FlushBatchId::from(self.next_ulid())
    }
}
