//! Status - 運用向けの薄いコントロール面
//!
//! `ControlHandle` is what an external control layer (HTTP endpoint, CLI,
//! admin shell) calls into: backlog and counters, pause/resume dispatch,
//! force a flush. It is cheap to clone and never blocks the pipeline.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::app::broker_pool::BrokerClientPool;
use crate::app::coalescer::{FlushOutcome, StatusCoalescer};
use crate::app::consumer::{ConsumerStats, ConsumerStatsHandle};
use crate::app::scheduler::DispatchScheduler;
use crate::domain::{CoalescerError, LedgerError};
use crate::ports::{BacklogCounts, Ledger};

/// Point-in-time status snapshot.
///
/// Backlog fields are `None` when the store could not be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatus {
    pub backlog: Option<u64>,
    pub unreceived: Option<u64>,
    pub dead_lettered: Option<u64>,
    pub in_flight: usize,
    pub broker_outstanding: usize,
    pub pending_status_updates: usize,
    pub dispatched_ok: u64,
    pub dispatch_failures: u64,
    pub retry_cap_reached: u64,
    pub store_errors: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub consecutive_flush_failures: u64,
    pub overflowed: u64,
    pub status_deferrals: u64,
    pub stalled_status_updates: u64,
    pub dispatch_window_full: u64,
    pub received: u64,
    pub handler_failures: u64,
    pub paused: bool,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct ControlHandle {
    ledger: Arc<dyn Ledger>,
    scheduler: Arc<DispatchScheduler>,
    coalescer: Arc<StatusCoalescer>,
    pool: Arc<BrokerClientPool>,
    consumers: Option<ConsumerStatsHandle>,
    max_retries: u32,
}

impl ControlHandle {
    pub(crate) fn new(
        ledger: Arc<dyn Ledger>,
        scheduler: Arc<DispatchScheduler>,
        coalescer: Arc<StatusCoalescer>,
        pool: Arc<BrokerClientPool>,
        consumers: Option<ConsumerStatsHandle>,
        max_retries: u32,
    ) -> Self {
        Self {
            ledger,
            scheduler,
            coalescer,
            pool,
            consumers,
            max_retries,
        }
    }

    pub async fn backlog(&self) -> Result<BacklogCounts, LedgerError> {
        self.ledger.backlog(self.max_retries).await
    }

    pub async fn status(&self) -> DispatcherStatus {
        let backlog = match self.backlog().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "backlog query failed");
                None
            }
        };
        let scheduler = self.scheduler.stats();
        let coalescer = self.coalescer.stats();
        let consumers = self
            .consumers
            .as_ref()
            .map(ConsumerStatsHandle::stats)
            .unwrap_or_default();

        DispatcherStatus {
            backlog: backlog.map(|b| b.undispatched),
            unreceived: backlog.map(|b| b.unreceived),
            dead_lettered: backlog.map(|b| b.dead_lettered),
            in_flight: scheduler.in_flight,
            broker_outstanding: self.pool.outstanding(),
            pending_status_updates: coalescer.pending,
            dispatched_ok: scheduler.dispatched_ok,
            dispatch_failures: scheduler.dispatch_failures,
            retry_cap_reached: scheduler.dead_lettered,
            store_errors: scheduler.store_errors,
            flushes: coalescer.flushes,
            flush_failures: coalescer.flush_failures,
            consecutive_flush_failures: coalescer.consecutive_flush_failures,
            overflowed: coalescer.overflowed,
            status_deferrals: coalescer.deferred,
            stalled_status_updates: coalescer.stalled,
            dispatch_window_full: scheduler.window_full,
            received: consumers.received,
            handler_failures: consumers.handler_failures,
            paused: self.scheduler.is_paused(),
            degraded: self.coalescer.is_degraded(),
        }
    }

    pub fn consumer_stats(&self) -> Option<ConsumerStats> {
        self.consumers.as_ref().map(ConsumerStatsHandle::stats)
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    /// Flush pending status updates now instead of waiting for a trigger.
    pub async fn force_flush(&self) -> Result<FlushOutcome, CoalescerError> {
        let outcome = self.coalescer.flush().await?;
        info!(applied = outcome.applied, deferred = outcome.deferred, "forced status flush");
        Ok(outcome)
    }

    /// True after a pending-set overflow or while flushes keep failing.
    pub fn is_degraded(&self) -> bool {
        self.coalescer.is_degraded()
    }
}
