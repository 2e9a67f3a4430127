//! InMemoryLedger - 開発用・テスト用の outbox ストア
//!
//! Rows live in a `BTreeMap`. Next to them sits one ordered set per
//! filtered index declared in `OUTBOX_TABLE.indexes`:
//! - undispatched: `(group_key, rank, id)` for rows with `produced_at IS NULL`
//! - unreceived: `id` for rows produced but not yet received
//!
//! Keys are built from each descriptor's column list and membership follows
//! `IndexDescriptor::covers`. The producer scan only reads the
//! `ProducerScan` index; status writes only maintain them. A single
//! `parking_lot::Mutex` guards everything and is never held across an
//! `.await`.
//!
//! # Fault injection
//! - `fail_next_bulk_updates(n)`: the next `n` bulk writes fail
//! - `set_unavailable(true)`: every call fails until cleared
//! - `set_write_latency(d)`: bulk writes sleep before applying
//!
//! Every trait call checks out one of `connection_pool_size` connections
//! for its duration, so a slow write holds a connection the way a real
//! pool would.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::DispatcherConfig;
use crate::domain::{
    AccessPath, GroupKey, IndexDescriptor, LedgerError, LifecycleError, NewOutboxRecord,
    OUTBOX_TABLE, OutboxRecord, RecordId, StatusField,
};
use crate::ports::{BacklogCounts, BulkUpdateReport, Clock, Ledger, SystemClock};

pub const DEFAULT_CONNECTIONS: usize = 4;

/// One column value inside an index key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Group(GroupKey),
    Rank(i64),
    Id(RecordId),
}

/// Index key: the descriptor's columns, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey(Vec<KeyPart>);

impl IndexKey {
    fn record_id(&self) -> Option<RecordId> {
        self.0.iter().find_map(|part| match part {
            KeyPart::Id(id) => Some(*id),
            _ => None,
        })
    }
}

struct FilteredIndex {
    descriptor: &'static IndexDescriptor,
    entries: BTreeSet<IndexKey>,
}

impl FilteredIndex {
    fn new(descriptor: &'static IndexDescriptor) -> Self {
        Self {
            descriptor,
            entries: BTreeSet::new(),
        }
    }

    fn key(&self, record: &OutboxRecord) -> IndexKey {
        IndexKey(
            self.descriptor
                .columns
                .iter()
                .filter_map(|column| match *column {
                    "group_key" => Some(KeyPart::Group(record.group_key.clone())),
                    "rank" => Some(KeyPart::Rank(record.rank)),
                    "id" => Some(KeyPart::Id(record.id)),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Add or drop the row's entry so it matches the index filter.
    fn sync(&mut self, record: &OutboxRecord) {
        let key = self.key(record);
        if self.descriptor.covers(record) {
            self.entries.insert(key);
        } else {
            self.entries.remove(&key);
        }
    }

    /// Row ids in index order. Every outbox index carries the primary key.
    fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.entries.iter().filter_map(IndexKey::record_id)
    }
}

fn build_indexes() -> Vec<FilteredIndex> {
    OUTBOX_TABLE
        .indexes
        .iter()
        .map(FilteredIndex::new)
        .collect()
}

#[derive(Default)]
struct LedgerState {
    rows: BTreeMap<RecordId, OutboxRecord>,
    indexes: Vec<FilteredIndex>,
    next_id: i64,
    closed: bool,
    unavailable: bool,
    fail_next_bulk: usize,
    bulk_calls: usize,
    write_latency: Option<Duration>,
}

impl LedgerState {
    fn check_open(&self) -> Result<(), LedgerError> {
        if self.closed {
            return Err(LedgerError::Closed);
        }
        if self.unavailable {
            return Err(LedgerError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn index(&self, path: AccessPath) -> Option<&FilteredIndex> {
        self.indexes.iter().find(|i| i.descriptor.access_path == path)
    }

    fn reindex(indexes: &mut [FilteredIndex], record: &OutboxRecord) {
        for index in indexes {
            index.sync(record);
        }
    }
}

pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    clock: Arc<dyn Clock>,
    connections: Semaphore,
    pool_size: usize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                indexes: build_indexes(),
                next_id: 1,
                ..LedgerState::default()
            }),
            clock,
            connections: Semaphore::new(DEFAULT_CONNECTIONS),
            pool_size: DEFAULT_CONNECTIONS,
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new().with_connection_pool_size(config.connection_pool_size)
    }

    pub fn with_connection_pool_size(mut self, size: usize) -> Self {
        let size = size.max(1);
        self.connections = Semaphore::new(size);
        self.pool_size = size;
        self
    }

    pub fn connections_in_use(&self) -> usize {
        self.pool_size - self.connections.available_permits()
    }

    async fn connection(&self) -> Result<SemaphorePermit<'_>, LedgerError> {
        self.connections.acquire().await.map_err(|_| LedgerError::Closed)
    }

    /// Insert a row the way the upstream transactional writer would.
    pub fn insert(&self, input: NewOutboxRecord) -> RecordId {
        let created_at = self.clock.now();
        let mut state = self.state.lock();
        let id = RecordId::new(state.next_id);
        state.next_id += 1;

        let record = OutboxRecord::new(id, input, created_at);
        LedgerState::reindex(&mut state.indexes, &record);
        state.rows.insert(id, record);
        id
    }

    pub fn insert_many(&self, inputs: impl IntoIterator<Item = NewOutboxRecord>) -> Vec<RecordId> {
        inputs.into_iter().map(|input| self.insert(input)).collect()
    }

    pub fn get(&self, id: RecordId) -> Option<OutboxRecord> {
        self.state.lock().rows.get(&id).cloned()
    }

    /// Snapshot of every row, ascending by id.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.state.lock().rows.values().cloned().collect()
    }

    /// Number of bulk status statements issued so far (including failed ones).
    pub fn bulk_update_calls(&self) -> usize {
        self.state.lock().bulk_calls
    }

    pub fn fail_next_bulk_updates(&self, n: usize) {
        self.state.lock().fail_next_bulk = n;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn set_write_latency(&self, latency: Option<Duration>) {
        self.state.lock().write_latency = latency;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Entries in the index serving `path`.
    pub fn index_len(&self, path: AccessPath) -> usize {
        self.state
            .lock()
            .index(path)
            .map_or(0, |index| index.entries.len())
    }

    pub fn undispatched_index_len(&self) -> usize {
        self.index_len(AccessPath::ProducerScan)
    }

    pub fn unreceived_index_len(&self) -> usize {
        self.index_len(AccessPath::ConsumerUpdate)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn select_eligible_for_dispatch(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<OutboxRecord>, LedgerError> {
        let _conn = self.connection().await?;
        let state = self.state.lock();
        state.check_open()?;

        // index scan only; dead letters stay in the index but are skipped
        let Some(index) = state.index(AccessPath::ProducerScan) else {
            return Ok(Vec::new());
        };
        let selected = index
            .ids()
            .filter_map(|id| state.rows.get(&id))
            .filter(|record| !record.retries_exhausted(max_retries))
            .take(limit)
            .cloned()
            .collect();
        Ok(selected)
    }

    async fn bulk_update_status(
        &self,
        ids: &[RecordId],
        field: StatusField,
        at: DateTime<Utc>,
    ) -> Result<BulkUpdateReport, LedgerError> {
        let _conn = self.connection().await?;
        let latency = {
            let mut state = self.state.lock();
            state.bulk_calls += 1;
            state.check_open()?;
            if state.fail_next_bulk > 0 {
                state.fail_next_bulk -= 1;
                return Err(LedgerError::Unavailable(
                    "injected bulk update failure".to_string(),
                ));
            }
            state.write_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.check_open()?;
        let LedgerState { rows, indexes, .. } = &mut *state;

        // one "statement": every id is applied under the same lock
        let mut report = BulkUpdateReport::default();
        for &id in ids {
            let Some(record) = rows.get_mut(&id) else {
                report.missing.push(id);
                continue;
            };
            match record.apply(field, at) {
                Ok(()) => {
                    LedgerState::reindex(indexes.as_mut_slice(), record);
                    report.applied.push(id);
                }
                Err(LifecycleError::AlreadySet(_)) => report.already_set.push(id),
                Err(LifecycleError::MissingPrerequisite { .. }) => report.deferred.push(id),
                Err(LifecycleError::NotPending) => report.deferred.push(id),
            }
        }
        Ok(report)
    }

    async fn record_dispatch_failure(
        &self,
        id: RecordId,
        error_code: &str,
    ) -> Result<u32, LedgerError> {
        let _conn = self.connection().await?;
        let mut state = self.state.lock();
        state.check_open()?;
        let record = state.rows.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        match record.record_failure(error_code) {
            Ok(retry_count) => Ok(retry_count),
            // a duplicate send failed after an earlier one succeeded: nothing to count
            Err(_) => Ok(record.retry_count),
        }
    }

    async fn backlog(&self, max_retries: u32) -> Result<BacklogCounts, LedgerError> {
        let _conn = self.connection().await?;
        let state = self.state.lock();
        state.check_open()?;

        let mut counts = BacklogCounts {
            unreceived: state
                .index(AccessPath::ConsumerUpdate)
                .map_or(0, |index| index.entries.len() as u64),
            ..BacklogCounts::default()
        };
        let undispatched = state
            .index(AccessPath::ProducerScan)
            .into_iter()
            .flat_map(|index| index.ids());
        for id in undispatched {
            match state.rows.get(&id) {
                Some(record) if record.retries_exhausted(max_retries) => {
                    counts.dead_lettered += 1
                }
                Some(_) => counts.undispatched += 1,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn close(&self) {
        self.state.lock().closed = true;
        self.connections.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(group: &str, rank: i64) -> NewOutboxRecord {
        NewOutboxRecord::new(GroupKey::new(group).unwrap(), rank, format!("{group}:{rank}"))
    }

    #[tokio::test]
    async fn select_orders_by_group_then_rank() {
        let ledger = InMemoryLedger::new();
        let b1 = ledger.insert(input("B", 1));
        let a2 = ledger.insert(input("A", 2));
        let a1 = ledger.insert(input("A", 1));

        let selected: Vec<_> = ledger
            .select_eligible_for_dispatch(10, 5)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(selected, vec![a1, a2, b1]);
    }

    #[tokio::test]
    async fn produced_moves_row_between_indexes() {
        let ledger = InMemoryLedger::new();
        let id = ledger.insert(input("G1", 0));
        assert_eq!(ledger.undispatched_index_len(), 1);

        let report = ledger
            .bulk_update_status(&[id], StatusField::Produced, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.applied, vec![id]);
        assert_eq!(ledger.undispatched_index_len(), 0);
        assert_eq!(ledger.unreceived_index_len(), 1);
        assert!(ledger.select_eligible_for_dispatch(10, 5).await.unwrap().is_empty());

        ledger
            .bulk_update_status(&[id], StatusField::Received, Utc::now())
            .await
            .unwrap();
        assert_eq!(ledger.unreceived_index_len(), 0);
    }

    #[tokio::test]
    async fn repeating_a_bulk_update_is_a_no_op() {
        let ledger = InMemoryLedger::new();
        let id = ledger.insert(input("G1", 0));
        let first_at = Utc::now();

        ledger
            .bulk_update_status(&[id], StatusField::Produced, first_at)
            .await
            .unwrap();
        let second = ledger
            .bulk_update_status(&[id], StatusField::Produced, Utc::now())
            .await
            .unwrap();

        assert!(second.applied.is_empty());
        assert_eq!(second.already_set, vec![id]);
        assert_eq!(ledger.get(id).unwrap().produced_at(), Some(first_at));
    }

    #[tokio::test]
    async fn received_before_produced_is_deferred() {
        let ledger = InMemoryLedger::new();
        let id = ledger.insert(input("G1", 0));
        let missing = RecordId::new(999);

        let report = ledger
            .bulk_update_status(&[id, missing], StatusField::Received, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.deferred, vec![id]);
        assert_eq!(report.missing, vec![missing]);
        assert!(ledger.get(id).unwrap().received_at.is_none());
    }

    #[tokio::test]
    async fn failures_count_towards_dead_letter() {
        let ledger = InMemoryLedger::new();
        let id = ledger.insert(input("G1", 0));

        for expected in 1..=3 {
            let count = ledger
                .record_dispatch_failure(id, "broker_connection")
                .await
                .unwrap();
            assert_eq!(count, expected);
        }
        // first attempt plus two retries: still one retry under a cap of 3
        assert_eq!(ledger.select_eligible_for_dispatch(10, 3).await.unwrap().len(), 1);
        assert_eq!(ledger.backlog(3).await.unwrap().dead_lettered, 0);

        ledger.record_dispatch_failure(id, "broker_connection").await.unwrap();
        assert!(ledger.select_eligible_for_dispatch(10, 3).await.unwrap().is_empty());
        let backlog = ledger.backlog(3).await.unwrap();
        assert_eq!(backlog.dead_lettered, 1);
        assert_eq!(backlog.undispatched, 0);
        assert_eq!(
            ledger.get(id).unwrap().error_code.as_deref(),
            Some("broker_connection")
        );
    }

    #[tokio::test]
    async fn index_sets_follow_the_table_descriptors() {
        let ledger = InMemoryLedger::new();
        let ids = ledger.insert_many((0..6).map(|rank| input("G1", rank)));
        ledger
            .bulk_update_status(&ids[..4], StatusField::Produced, Utc::now())
            .await
            .unwrap();
        ledger
            .bulk_update_status(&ids[..1], StatusField::Received, Utc::now())
            .await
            .unwrap();

        let rows = ledger.records();
        for descriptor in OUTBOX_TABLE.indexes {
            let covered = rows.iter().filter(|r| descriptor.covers(r)).count();
            assert_eq!(
                ledger.index_len(descriptor.access_path),
                covered,
                "{}",
                descriptor.name
            );
        }
        assert_eq!(ledger.undispatched_index_len(), 2);
        assert_eq!(ledger.unreceived_index_len(), 3);
    }

    #[tokio::test]
    async fn injected_failures_and_close() {
        let ledger = InMemoryLedger::new();
        let id = ledger.insert(input("G1", 0));

        ledger.fail_next_bulk_updates(1);
        assert!(matches!(
            ledger
                .bulk_update_status(&[id], StatusField::Produced, Utc::now())
                .await,
            Err(LedgerError::Unavailable(_))
        ));
        ledger
            .bulk_update_status(&[id], StatusField::Produced, Utc::now())
            .await
            .unwrap();
        assert_eq!(ledger.bulk_update_calls(), 2);

        ledger.close().await;
        assert!(ledger.is_closed());
        assert_eq!(
            ledger.record_dispatch_failure(id, "x").await,
            Err(LedgerError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_writes_hold_a_connection() {
        let ledger = Arc::new(InMemoryLedger::new().with_connection_pool_size(1));
        let a = ledger.insert(input("G1", 0));
        let b = ledger.insert(input("G1", 1));
        ledger.set_write_latency(Some(Duration::from_millis(50)));

        let started = tokio::time::Instant::now();
        let first = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .bulk_update_status(&[a], StatusField::Produced, Utc::now())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(ledger.connections_in_use(), 1);

        ledger
            .bulk_update_status(&[b], StatusField::Produced, Utc::now())
            .await
            .unwrap();
        first.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(ledger.connections_in_use(), 0);
    }
}
