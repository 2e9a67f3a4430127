//! Ledger port - outbox ストア（source of truth）
//!
//! Two access paths, kept on disjoint indexes:
//! - producer scan: `select_eligible_for_dispatch` (undispatched index)
//! - status writes: `bulk_update_status` (keyed by id)
//!
//! `record_dispatch_failure` is the direct, per-record write used on send
//! failures, which are rare enough not to need coalescing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{LedgerError, OutboxRecord, RecordId, StatusField};

/// Outcome of one bulk status write.
///
/// Every requested id lands in exactly one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkUpdateReport {
    /// Field was NULL and is now set.
    pub applied: Vec<RecordId>,
    /// Field was already set; left untouched.
    pub already_set: Vec<RecordId>,
    /// Prerequisite field not yet persisted; caller should retry later.
    pub deferred: Vec<RecordId>,
    /// No such row.
    pub missing: Vec<RecordId>,
}

impl BulkUpdateReport {
    /// Ids that reached their final state for this field.
    pub fn settled(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.applied.iter().chain(self.already_set.iter()).copied()
    }

    pub fn total(&self) -> usize {
        self.applied.len() + self.already_set.len() + self.deferred.len() + self.missing.len()
    }
}

/// Backlog counters for the control surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BacklogCounts {
    /// `produced_at IS NULL` and still under the retry cap.
    pub undispatched: u64,
    /// Produced but not yet received.
    pub unreceived: u64,
    /// `produced_at IS NULL` and at or over the retry cap.
    pub dead_lettered: u64,
}

/// Ledger は outbox テーブルへのアクセスを抽象化
///
/// # 設計
/// - 行の作成は上流の transactional writer の責務（ここでは扱わない）
/// - 行の削除もしない（archival は外部）
/// - `Send + Sync`: scheduler / coalescer / control surface から共有される
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Undispatched records under the retry cap, ascending by
    /// `(group_key, rank, id)`, at most `limit` of them.
    async fn select_eligible_for_dispatch(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<OutboxRecord>, LedgerError>;

    /// Set `field = at` for every id whose field is still NULL, in one
    /// statement. Safe to repeat.
    async fn bulk_update_status(
        &self,
        ids: &[RecordId],
        field: StatusField,
        at: DateTime<Utc>,
    ) -> Result<BulkUpdateReport, LedgerError>;

    /// Increment `retry_count`, set `error_code`. Returns the new retry count.
    async fn record_dispatch_failure(
        &self,
        id: RecordId,
        error_code: &str,
    ) -> Result<u32, LedgerError>;

    async fn backlog(&self, max_retries: u32) -> Result<BacklogCounts, LedgerError>;

    /// Release store connections. Called last during shutdown.
    async fn close(&self) {}
}
