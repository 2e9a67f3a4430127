//! DispatchScheduler - 未送信レコードを拾って broker pool に投入
//!
//! Tasks:
//! - the poll loop: select eligible records, submit them in
//!   `(group_key, rank)` order, adapt the poll delay
//! - one completion lane per pool handle: awaits that handle's acks in
//!   submission order and turns each into a coalesced `Produced` update
//!   (success) or a direct failure write. A hung send only holds back the
//!   lane of its own handle
//!
//! Ids submitted but not yet flushed as `Produced` sit in the
//! `InFlightRegistry` and are skipped by later polls, so a record is not
//! sent twice while its first send is still in progress. The registry is
//! capped at `DispatcherConfig::dispatch_window`; a full window skips the
//! poll until flushes make room.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app::backoff::PollBackoff;
use crate::app::broker_pool::{BrokerClientPool, PendingAck};
use crate::app::coalescer::{FlushListener, StatusCoalescer};
use crate::config::DispatcherConfig;
use crate::domain::{BrokerError, LedgerError, RecordId, StatusField};
use crate::ports::{Clock, Ledger};

/// Ids handed to the pool whose `Produced` status is not in the store yet.
///
/// A flushed id moves to `settled` instead of vanishing: a poll that read
/// the row just before the flush must still skip it. `settled` is cleared
/// when the next poll starts, since that poll can no longer see those rows.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    inner: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    in_flight: HashSet<RecordId>,
    settled: HashSet<RecordId>,
}

impl InFlightRegistry {
    pub fn insert(&self, id: RecordId) -> bool {
        self.inner.lock().in_flight.insert(id)
    }

    /// Back to eligible (failed or abandoned send).
    pub fn remove(&self, id: RecordId) {
        self.inner.lock().in_flight.remove(&id);
    }

    pub fn contains(&self, id: RecordId) -> bool {
        let inner = self.inner.lock();
        inner.in_flight.contains(&id) || inner.settled.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().in_flight.is_empty()
    }

    fn begin_poll(&self) {
        self.inner.lock().settled.clear();
    }
}

impl FlushListener for InFlightRegistry {
    fn on_flushed(&self, field: StatusField, ids: &[RecordId]) {
        if field != StatusField::Produced {
            return;
        }
        let mut inner = self.inner.lock();
        for id in ids {
            if inner.in_flight.remove(id) {
                inner.settled.insert(*id);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    empty_cycles: AtomicU64,
    submitted: AtomicU64,
    dispatched_ok: AtomicU64,
    dispatch_failures: AtomicU64,
    dead_lettered: AtomicU64,
    store_errors: AtomicU64,
    window_full: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub empty_cycles: u64,
    pub submitted: u64,
    pub dispatched_ok: u64,
    pub dispatch_failures: u64,
    pub dead_lettered: u64,
    pub store_errors: u64,
    /// Cycles skipped because the in-flight window was full.
    pub window_full: u64,
    pub in_flight: usize,
}

enum Cycle {
    Submitted(usize),
    WindowFull,
    Stopped,
}

/// Join handles of the scheduler tasks.
pub struct SchedulerTasks {
    pub poll_loop: JoinHandle<()>,
    /// One per pool handle, in handle order.
    pub completions: Vec<JoinHandle<()>>,
}

pub struct DispatchScheduler {
    ledger: Arc<dyn Ledger>,
    pool: Arc<BrokerClientPool>,
    coalescer: Arc<StatusCoalescer>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<InFlightRegistry>,
    counters: Counters,
    paused: AtomicBool,
    resumed: Notify,
    batch_size: usize,
    max_retries: u32,
    window: usize,
    config: DispatcherConfig,
}

impl DispatchScheduler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        pool: Arc<BrokerClientPool>,
        coalescer: Arc<StatusCoalescer>,
        clock: Arc<dyn Clock>,
        config: &DispatcherConfig,
    ) -> Self {
        let in_flight = Arc::new(InFlightRegistry::default());
        coalescer.add_listener(in_flight.clone());
        Self {
            ledger,
            pool,
            coalescer,
            clock,
            in_flight,
            counters: Counters::default(),
            paused: AtomicBool::new(false),
            resumed: Notify::new(),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            window: config.dispatch_window().max(1),
            config: config.clone(),
        }
    }

    /// Start the poll loop and one completion lane per pool handle.
    ///
    /// A lane holds at most one handle's worth of acks; the poll loop waits
    /// when a lane falls that far behind.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> SchedulerTasks {
        let lanes = self.pool.handle_count().max(1);
        let mut senders = Vec::with_capacity(lanes);
        let mut completions = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (done_tx, done_rx) = mpsc::channel(self.pool.max_buffer().max(1));
            senders.push(done_tx);
            completions.push(tokio::spawn(Arc::clone(self).run_completions(lane, done_rx)));
        }
        let poll_loop = tokio::spawn(Arc::clone(self).run_poll_loop(shutdown, senders));
        SchedulerTasks {
            poll_loop,
            completions,
        }
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("dispatch paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("dispatch resumed");
        }
        self.resumed.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            empty_cycles: self.counters.empty_cycles.load(Ordering::Relaxed),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dispatched_ok: self.counters.dispatched_ok.load(Ordering::Relaxed),
            dispatch_failures: self.counters.dispatch_failures.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
            window_full: self.counters.window_full.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }

    async fn run_poll_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        lanes: Vec<mpsc::Sender<PendingAck>>,
    ) {
        info!(
            batch_size = self.batch_size,
            max_retries = self.max_retries,
            window = self.window,
            lanes = lanes.len(),
            "dispatch scheduler started"
        );
        let mut backoff = PollBackoff::from_config(&self.config);
        let mut idle = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.is_paused() {
                let resumed = self.resumed.notified();
                tokio::pin!(resumed);
                resumed.as_mut().enable();
                if !self.is_paused() {
                    continue;
                }
                tokio::select! {
                    _ = resumed => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            self.counters.cycles.fetch_add(1, Ordering::Relaxed);
            let delay = match self.cycle(&lanes, &mut shutdown).await {
                Ok(Cycle::Stopped) => break,
                Ok(Cycle::WindowFull) => {
                    self.counters.window_full.fetch_add(1, Ordering::Relaxed);
                    // waiting on flushes, not on new rows: no backoff
                    self.config.base_poll_interval()
                }
                Ok(Cycle::Submitted(n)) if n > 0 => {
                    idle = false;
                    backoff.on_records()
                }
                Ok(Cycle::Submitted(_)) => {
                    self.counters.empty_cycles.fetch_add(1, Ordering::Relaxed);
                    if !idle {
                        // going idle: push out whatever the handles buffered
                        self.pool.flush().await;
                        idle = true;
                    }
                    backoff.on_empty(Instant::now())
                }
                Err(e) => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "eligible-record poll failed, retrying next cycle");
                    backoff.on_empty(Instant::now())
                }
            };
            debug!(delay_ms = delay.as_millis() as u64, "next poll");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(lanes);
        info!(in_flight = self.in_flight.len(), "dispatch scheduler stopped");
    }

    async fn cycle(
        &self,
        lanes: &[mpsc::Sender<PendingAck>],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Cycle, LedgerError> {
        self.in_flight.begin_poll();
        let in_flight = self.in_flight.len();
        if in_flight >= self.window {
            debug!(in_flight, window = self.window, "in-flight window full, skipping poll");
            return Ok(Cycle::WindowFull);
        }

        // in-flight rows still match the filter; ask for enough to see past
        // them, which the window keeps bounded
        let limit = self.batch_size + in_flight;
        let room = self.batch_size.min(self.window - in_flight);
        let records = self
            .ledger
            .select_eligible_for_dispatch(limit, self.max_retries)
            .await?;

        let fresh: Vec<_> = records
            .into_iter()
            .filter(|r| !self.in_flight.contains(r.id))
            .take(room)
            .collect();
        debug!(selected = fresh.len(), limit, in_flight, "poll cycle");

        let mut submitted = 0;
        for mut record in fresh {
            if self.is_paused() {
                break;
            }
            if record.begin_dispatch().is_err() {
                continue;
            }
            self.in_flight.insert(record.id);

            let submit = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.in_flight.remove(record.id);
                        return Ok(Cycle::Stopped);
                    }
                    // spurious change; submit anyway
                    self.pool.submit(&record).await
                }
                pending = self.pool.submit(&record) => pending,
            };

            match submit {
                Ok(pending) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    submitted += 1;
                    let Some(lane) = lanes.get(pending.handle) else {
                        error!(handle = pending.handle, "no completion lane for pool handle");
                        self.in_flight.remove(pending.record_id);
                        continue;
                    };
                    if let Err(mpsc::error::SendError(pending)) = lane.send(pending).await {
                        // lane is gone; nothing will observe this ack
                        self.in_flight.remove(pending.record_id);
                    }
                }
                Err(BrokerError::PoolClosed) => {
                    self.in_flight.remove(record.id);
                    return Ok(Cycle::Stopped);
                }
                Err(e) => {
                    self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                    self.record_failure(record.id, &e).await;
                }
            }
        }
        Ok(Cycle::Submitted(submitted))
    }

    async fn run_completions(
        self: Arc<Self>,
        lane: usize,
        mut done_rx: mpsc::Receiver<PendingAck>,
    ) {
        // a group stays on one handle, so per-lane order is per-group rank order
        while let Some(mut pending) = done_rx.recv().await {
            let id = pending.record_id;
            match pending.wait().await {
                Ok(ack) => {
                    self.counters.dispatched_ok.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        lane,
                        record_id = %id,
                        group_key = %pending.group_key,
                        partition = %ack.partition,
                        offset = ack.offset,
                        "broker ack"
                    );
                    if let Err(e) = self
                        .coalescer
                        .enqueue(id, StatusField::Produced, self.clock.now())
                    {
                        // never flushed: let a later poll dispatch it again
                        error!(record_id = %id, error = %e, "could not queue produced status");
                        self.in_flight.remove(id);
                    }
                }
                Err(BrokerError::Abandoned | BrokerError::PoolClosed) => {
                    debug!(record_id = %id, "send abandoned, record stays eligible");
                    self.in_flight.remove(id);
                }
                Err(e) => {
                    self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                    self.record_failure(id, &e).await;
                }
            }
            // the group may change handles only after this status is queued
            drop(pending);
        }
        debug!(lane, "dispatch completions drained");
    }

    /// Direct failure write; the record stays eligible until its retries
    /// run past the cap.
    async fn record_failure(&self, id: RecordId, err: &BrokerError) {
        match self.ledger.record_dispatch_failure(id, err.code()).await {
            Ok(retry_count) if retry_count > self.max_retries => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    record_id = %id,
                    retry_count,
                    error = %err,
                    "retry cap reached, record dead-lettered"
                );
            }
            Ok(retry_count) => {
                warn!(record_id = %id, retry_count, error = %err, "dispatch failed, will retry");
            }
            Err(e) => {
                warn!(record_id = %id, error = %e, send_error = %err, "could not record dispatch failure");
            }
        }
        self.in_flight.remove(id);
    }
}
