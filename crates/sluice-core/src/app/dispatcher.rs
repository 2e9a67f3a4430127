//! Dispatcher - 起動済みパイプラインと順序付きシャットダウン
//!
//! # シャットダウン順序
//! 1. intake 停止: scheduler の poll と consumer の pull を止める
//! 2. in-flight の ack を待つ (drain timeout まで)
//! 3. broker pool を drain / flush
//! 4. flush loop を止めて最終 flush
//! 5. ledger を close
//!
//! Status that was acked but not flushed is only safe once step 4 ran, so
//! the ledger is released last.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::app::broker_pool::BrokerClientPool;
use crate::app::coalescer::StatusCoalescer;
use crate::app::consumer::ConsumerGroup;
use crate::app::scheduler::{DispatchScheduler, SchedulerTasks};
use crate::app::status::{ControlHandle, DispatcherStatus};
use crate::config::DispatcherConfig;
use crate::domain::{CoalescerError, MemberId};
use crate::ports::Ledger;

/// What `Dispatcher::shutdown` observed on the way down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Acks still unresolved when the drain timeout hit.
    pub completions_timed_out: bool,
    /// Sends the pool gave up on; those records stay eligible.
    pub abandoned_sends: usize,
    /// Status updates written by the final flush.
    pub final_flush_applied: usize,
    /// Status updates that never reached the store.
    pub unflushed: usize,
    pub status: DispatcherStatus,
}

impl ShutdownReport {
    /// Every acknowledged status made it to the store.
    pub fn is_clean(&self) -> bool {
        !self.completions_timed_out && self.unflushed == 0
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    ledger: Arc<dyn Ledger>,
    pool: Arc<BrokerClientPool>,
    coalescer: Arc<StatusCoalescer>,
    consumers: Option<ConsumerGroup>,
    control: ControlHandle,
    intake_tx: watch::Sender<bool>,
    flush_tx: watch::Sender<bool>,
    scheduler_tasks: SchedulerTasks,
    flush_loop: JoinHandle<()>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: DispatcherConfig,
        ledger: Arc<dyn Ledger>,
        pool: Arc<BrokerClientPool>,
        coalescer: Arc<StatusCoalescer>,
        scheduler: Arc<DispatchScheduler>,
        consumers: Option<ConsumerGroup>,
        intake_tx: watch::Sender<bool>,
        flush_tx: watch::Sender<bool>,
        scheduler_tasks: SchedulerTasks,
        flush_loop: JoinHandle<()>,
    ) -> Self {
        let control = ControlHandle::new(
            Arc::clone(&ledger),
            scheduler,
            Arc::clone(&coalescer),
            Arc::clone(&pool),
            consumers.as_ref().map(ConsumerGroup::stats_handle),
            config.max_retries,
        );
        Self {
            config,
            ledger,
            pool,
            coalescer,
            consumers,
            control,
            intake_tx,
            flush_tx,
            scheduler_tasks,
            flush_loop,
        }
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn consumer_members(&self) -> &[MemberId] {
        self.consumers
            .as_ref()
            .map(ConsumerGroup::members)
            .unwrap_or(&[])
    }

    /// Graceful stop in the order listed in the module docs.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            config,
            ledger,
            pool,
            coalescer,
            mut consumers,
            control,
            intake_tx,
            flush_tx,
            scheduler_tasks,
            flush_loop,
        } = self;
        let SchedulerTasks {
            poll_loop,
            completions,
        } = scheduler_tasks;
        let deadline = Instant::now() + config.drain_timeout();
        info!(drain_timeout_ms = config.drain_timeout_ms, "dispatcher shutting down");

        // 1. intake
        intake_tx.send_replace(true);
        if let Err(e) = poll_loop.await
            && !e.is_cancelled()
        {
            error!(error = %e, "scheduler poll loop panicked");
        }
        if let Some(group) = consumers.as_mut() {
            group.join().await;
        }

        // 2. in-flight acks, one completion lane per pool handle
        let mut completions_timed_out = false;
        for (lane, mut completion) in completions.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut completion).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(lane, error = %e, "completion task panicked"),
                Err(_) => {
                    completion.abort();
                    warn!(lane, "in-flight acks did not settle before the drain timeout");
                    completions_timed_out = true;
                }
            }
        }

        // 3. pool
        let remaining = deadline.saturating_duration_since(Instant::now());
        let drain = pool.drain(remaining).await;

        // 4. final flush
        flush_tx.send_replace(true);
        if let Err(e) = flush_loop.await
            && !e.is_cancelled()
        {
            error!(error = %e, "flush loop panicked");
        }
        let (final_flush_applied, unflushed) = match coalescer.shutdown_flush().await {
            Ok(outcome) => (outcome.applied, 0),
            Err(CoalescerError::Unflushed { remaining }) => (0, remaining),
            Err(e) => {
                error!(error = %e, "final flush failed");
                (0, coalescer.pending_len())
            }
        };

        let status = control.status().await;

        // 5. store
        ledger.close().await;

        let report = ShutdownReport {
            completions_timed_out,
            abandoned_sends: drain.abandoned,
            final_flush_applied,
            unflushed,
            status,
        };
        info!(
            abandoned_sends = report.abandoned_sends,
            final_flush_applied = report.final_flush_applied,
            unflushed = report.unflushed,
            clean = report.is_clean(),
            "dispatcher stopped"
        );
        report
    }

    /// Kill every task with no drain, no flush and no close. Pending status
    /// updates are lost, which is what a process crash looks like.
    pub fn abort(self) {
        let Self {
            pool,
            mut consumers,
            scheduler_tasks,
            flush_loop,
            ..
        } = self;
        scheduler_tasks.poll_loop.abort();
        for completion in &scheduler_tasks.completions {
            completion.abort();
        }
        flush_loop.abort();
        if let Some(group) = consumers.as_mut() {
            group.abort();
        }
        pool.abort();
        warn!("dispatcher aborted");
    }
}
