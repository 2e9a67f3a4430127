//! StatusCoalescer - ステータス更新をまとめて一括書き込み
//!
//! Many writers (dispatch completions, every consumer worker) call
//! `enqueue`; one flush loop turns the pending set into a few bulk
//! statements.
//!
//! # 設計
//! - `enqueue` is sync and O(1): a short `parking_lot` lock on the pending
//!   set, never held across an `.await`
//! - a flush swaps the pending set out under that lock, so enqueues that
//!   arrive during a slow store write land in the fresh set
//! - flushes are serialized (`flush_gate`); fields go in lifecycle order
//!   (Produced, Received, Processed), one statement each, stamped with
//!   one `clock.now()` per flush
//! - on a store error the snapshot goes back into pending; on "deferred"
//!   (prerequisite not persisted yet) only those ids go back, and each
//!   entry counts how many flushes have deferred it. Past
//!   `STALLED_AFTER_DEFERRALS` the entry is logged once as stalled; it
//!   stays pending and still counts toward the cap
//! - `max_pending_updates` is a hard cap: reaching it is an alerting
//!   condition and the enqueue is refused

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::domain::{CoalescerError, FlushBatchId, RecordId, StatusField, StatusUpdate};
use crate::ports::{Clock, IdGenerator, Ledger};

/// Consecutive flush failures after which the process reports degraded.
pub const DEGRADED_AFTER_FAILURES: u64 = 5;

/// Final flush passes during shutdown (deferred ids may need a second pass).
pub const SHUTDOWN_FLUSH_PASSES: usize = 3;

/// Deferrals after which a pending entry is reported as stalled.
pub const STALLED_AFTER_DEFERRALS: u32 = 10;

/// Notified after each successful statement with the ids that left the
/// pending set for good (applied, already set, or gone from the store).
pub trait FlushListener: Send + Sync {
    fn on_flushed(&self, field: StatusField, ids: &[RecordId]);
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    observed_at: DateTime<Utc>,
    /// Flushes that found the prerequisite status missing.
    deferrals: u32,
}

type FieldSet = HashMap<RecordId, Entry>;

#[derive(Default)]
struct PendingSet {
    by_field: [FieldSet; 3],
}

fn slot(field: StatusField) -> usize {
    match field {
        StatusField::Produced => 0,
        StatusField::Received => 1,
        StatusField::Processed => 2,
    }
}

impl PendingSet {
    fn len(&self) -> usize {
        self.by_field.iter().map(HashMap::len).sum()
    }

    /// Put entries back; an entry enqueued meanwhile keeps its own
    /// timestamp but inherits the deferral count.
    fn merge(&mut self, field: StatusField, entries: FieldSet) {
        let set = &mut self.by_field[slot(field)];
        for (id, entry) in entries {
            set.entry(id)
                .and_modify(|kept| kept.deferrals = kept.deferrals.max(entry.deferrals))
                .or_insert(entry);
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    consecutive_failures: AtomicU64,
    overflowed: AtomicU64,
    applied: AtomicU64,
    deferred: AtomicU64,
    stalled: AtomicU64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoalescerStats {
    pub pending: usize,
    pub enqueued: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub consecutive_flush_failures: u64,
    pub overflowed: u64,
    pub applied: u64,
    /// Entries put back because their prerequisite was not in the store yet,
    /// counted once per flush.
    pub deferred: u64,
    /// Entries that crossed `STALLED_AFTER_DEFERRALS`.
    pub stalled: u64,
}

/// Result of one `flush`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub batch_id: Option<FlushBatchId>,
    pub statements: usize,
    pub applied: usize,
    pub already_set: usize,
    pub deferred: usize,
    pub missing: usize,
}

pub struct StatusCoalescer {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    batch_size: usize,
    cap: usize,
    flush_interval: Duration,
    pending: Mutex<PendingSet>,
    flush_gate: tokio::sync::Mutex<()>,
    size_trigger: Notify,
    listeners: Mutex<Vec<Arc<dyn FlushListener>>>,
    counters: Counters,
    closed: AtomicBool,
}

impl StatusCoalescer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            ledger,
            clock,
            ids,
            batch_size: config.batch_size.max(1),
            cap: config.max_pending_updates.max(1),
            flush_interval: config.flush_interval(),
            pending: Mutex::new(PendingSet::default()),
            flush_gate: tokio::sync::Mutex::new(()),
            size_trigger: Notify::new(),
            listeners: Mutex::new(Vec::new()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn FlushListener>) {
        self.listeners.lock().push(listener);
    }

    /// Record that `id`'s `field` was observed at `observed_at`.
    ///
    /// Duplicate `(id, field)` pairs collapse into one entry.
    pub fn enqueue(
        &self,
        id: RecordId,
        field: StatusField,
        observed_at: DateTime<Utc>,
    ) -> Result<(), CoalescerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoalescerError::Closed);
        }

        let len = {
            let mut pending = self.pending.lock();
            if pending.by_field[slot(field)].contains_key(&id) {
                return Ok(());
            }
            let len = pending.len();
            if len >= self.cap {
                drop(pending);
                self.counters.overflowed.fetch_add(1, Ordering::SeqCst);
                error!(
                    record_id = %id,
                    field = %field,
                    pending = len,
                    cap = self.cap,
                    "status coalescer overflow, update refused"
                );
                return Err(CoalescerError::PendingOverflow {
                    pending: len,
                    cap: self.cap,
                });
            }
            pending.by_field[slot(field)].insert(
                id,
                Entry {
                    observed_at,
                    deferrals: 0,
                },
            );
            len + 1
        };

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if len >= self.batch_size {
            self.size_trigger.notify_one();
        }
        Ok(())
    }

    pub fn enqueue_update(&self, update: StatusUpdate) -> Result<(), CoalescerError> {
        self.enqueue(update.id, update.field, update.observed_at)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_for(&self, field: StatusField) -> usize {
        self.pending.lock().by_field[slot(field)].len()
    }

    /// Write everything pending now. Serialized with other flushes.
    pub async fn flush(&self) -> Result<FlushOutcome, CoalescerError> {
        let _gate = self.flush_gate.lock().await;

        let mut snapshot = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut pending.by_field)
        };
        let mut outcome = FlushOutcome::default();
        if snapshot.iter().all(HashMap::is_empty) {
            return Ok(outcome);
        }

        let batch_id = self.ids.generate_flush_batch_id();
        let at = self.clock.now();
        outcome.batch_id = Some(batch_id);

        for (position, field) in StatusField::LIFECYCLE.into_iter().enumerate() {
            let entries = std::mem::take(&mut snapshot[slot(field)]);
            if entries.is_empty() {
                continue;
            }
            let mut ids: Vec<RecordId> = entries.keys().copied().collect();
            ids.sort();

            let report = match self.ledger.bulk_update_status(&ids, field, at).await {
                Ok(report) => report,
                Err(e) => {
                    // this field and everything after it goes back
                    let mut pending = self.pending.lock();
                    pending.merge(field, entries);
                    for later in StatusField::LIFECYCLE.into_iter().skip(position + 1) {
                        let rest = std::mem::take(&mut snapshot[slot(later)]);
                        pending.merge(later, rest);
                    }
                    drop(pending);

                    self.counters.flush_failures.fetch_add(1, Ordering::SeqCst);
                    let consecutive =
                        self.counters.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if consecutive >= DEGRADED_AFTER_FAILURES {
                        error!(
                            batch = %batch_id,
                            field = %field,
                            consecutive,
                            error = %e,
                            "status flush keeps failing"
                        );
                    } else {
                        warn!(
                            batch = %batch_id,
                            field = %field,
                            ids = ids.len(),
                            consecutive,
                            error = %e,
                            "status flush failed, entries kept pending"
                        );
                    }
                    return Err(CoalescerError::Ledger(e));
                }
            };
            outcome.statements += 1;

            if !report.deferred.is_empty() {
                let deferred = self.defer(batch_id, field, &report.deferred, &entries);
                self.pending.lock().merge(field, deferred);
            }
            if !report.missing.is_empty() {
                warn!(
                    batch = %batch_id,
                    field = %field,
                    missing = report.missing.len(),
                    "status update for unknown records dropped"
                );
            }

            let oldest = entries.values().map(|e| e.observed_at).min();
            debug!(
                batch = %batch_id,
                field = %field,
                applied = report.applied.len(),
                already_set = report.already_set.len(),
                deferred = report.deferred.len(),
                lag_ms = oldest.map(|o| (at - o).num_milliseconds()).unwrap_or(0),
                "status flush statement"
            );

            outcome.applied += report.applied.len();
            outcome.already_set += report.already_set.len();
            outcome.deferred += report.deferred.len();
            outcome.missing += report.missing.len();

            let done: Vec<RecordId> = report
                .settled()
                .chain(report.missing.iter().copied())
                .collect();
            if !done.is_empty() {
                let listeners = self.listeners.lock().clone();
                for listener in listeners {
                    listener.on_flushed(field, &done);
                }
            }
        }

        self.counters.flushes.fetch_add(1, Ordering::SeqCst);
        self.counters
            .applied
            .fetch_add(outcome.applied as u64, Ordering::SeqCst);
        self.counters.consecutive_failures.store(0, Ordering::SeqCst);
        Ok(outcome)
    }

    /// Bump the deferral count of each deferred entry; warn once per entry
    /// when it crosses the stall threshold.
    fn defer(
        &self,
        batch_id: FlushBatchId,
        field: StatusField,
        ids: &[RecordId],
        entries: &FieldSet,
    ) -> FieldSet {
        let mut deferred = FieldSet::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = entries.get(id) else {
                continue;
            };
            let entry = Entry {
                deferrals: entry.deferrals.saturating_add(1),
                ..*entry
            };
            if entry.deferrals == STALLED_AFTER_DEFERRALS {
                self.counters.stalled.fetch_add(1, Ordering::Relaxed);
                warn!(
                    batch = %batch_id,
                    record_id = %id,
                    field = %field,
                    deferrals = entry.deferrals,
                    observed_at = %entry.observed_at,
                    "status update stalled: prerequisite status never reached the store"
                );
            }
            deferred.insert(*id, entry);
        }
        self.counters
            .deferred
            .fetch_add(deferred.len() as u64, Ordering::Relaxed);
        deferred
    }

    /// Flush on size or interval until shutdown is signalled.
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
                _ = self.size_trigger.notified() => {}
            }

            if self.pending_len() == 0 {
                continue;
            }
            // failures are logged and counted inside flush
            let _ = self.flush().await;
            interval.reset();
        }
        debug!("flush loop stopped");
    }

    /// Final flush: refuse new enqueues, then flush until empty or out of
    /// passes. Anything left is lost and reported.
    pub async fn shutdown_flush(&self) -> Result<FlushOutcome, CoalescerError> {
        self.closed.store(true, Ordering::SeqCst);

        let mut total = FlushOutcome::default();
        let mut last_error = None;
        for _ in 0..SHUTDOWN_FLUSH_PASSES {
            if self.pending_len() == 0 {
                break;
            }
            match self.flush().await {
                Ok(outcome) => {
                    total.batch_id = outcome.batch_id.or(total.batch_id);
                    total.statements += outcome.statements;
                    total.applied += outcome.applied;
                    total.already_set += outcome.already_set;
                    total.deferred += outcome.deferred;
                    total.missing += outcome.missing;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let remaining = self.pending_len();
        if remaining > 0 {
            error!(
                remaining,
                last_error = ?last_error,
                "final flush left status updates unwritten"
            );
            return Err(CoalescerError::Unflushed { remaining });
        }
        info!(applied = total.applied, statements = total.statements, "final status flush done");
        Ok(total)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Overflowed at least once, or flushes keep failing.
    pub fn is_degraded(&self) -> bool {
        self.counters.overflowed.load(Ordering::SeqCst) > 0
            || self.counters.consecutive_failures.load(Ordering::SeqCst) >= DEGRADED_AFTER_FAILURES
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            pending: self.pending_len(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::SeqCst),
            flush_failures: self.counters.flush_failures.load(Ordering::SeqCst),
            consecutive_flush_failures: self.counters.consecutive_failures.load(Ordering::SeqCst),
            overflowed: self.counters.overflowed.load(Ordering::SeqCst),
            applied: self.counters.applied.load(Ordering::SeqCst),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            stalled: self.counters.stalled.load(Ordering::Relaxed),
        }
    }
}
