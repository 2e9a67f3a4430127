//! Shared rig for the scenario tests: one in-memory ledger and broker that
//! survive dispatcher restarts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::app::{Dispatcher, DispatcherBuilder, HandlerContext, HandlerError, RecordHandler};
use crate::config::DispatcherConfig;
use crate::domain::{GroupKey, NewOutboxRecord, OutboxEnvelope, OutboxRecord, RecordId};
use crate::impls::{InMemoryBroker, InMemoryLedger, PublishedMessage};

pub const PARTITIONS: u32 = 6;

/// Fast cadence so scenarios finish in a few virtual seconds.
pub fn config() -> DispatcherConfig {
    DispatcherConfig {
        base_poll_interval_ms: 10,
        max_poll_interval_ms: 100,
        flush_interval_ms: 50,
        consumer_poll_timeout_ms: 20,
        drain_timeout_ms: 1_000,
        ..DispatcherConfig::default()
    }
}

pub struct Harness {
    pub config: DispatcherConfig,
    pub ledger: Arc<InMemoryLedger>,
    pub broker: InMemoryBroker,
}

impl Harness {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            ledger: Arc::new(InMemoryLedger::from_config(&config)),
            broker: InMemoryBroker::new(PARTITIONS),
            config,
        }
    }

    pub fn seed(&self, group: &str, count: i64) -> Vec<RecordId> {
        let key = GroupKey::new(group).unwrap();
        self.ledger.insert_many(
            (0..count).map(|rank| NewOutboxRecord::new(key.clone(), rank, format!("{group}:{rank}"))),
        )
    }

    fn builder(&self) -> DispatcherBuilder {
        DispatcherBuilder::new(self.config.clone())
            .ledger(self.ledger.clone())
            .broker(Arc::new(self.broker.clone()))
    }

    /// Producer side only.
    pub async fn start(&self) -> Dispatcher {
        self.builder().start().await.unwrap()
    }

    pub async fn start_with_consumers(&self, handler: Arc<dyn RecordHandler>) -> Dispatcher {
        self.builder()
            .consumers(Arc::new(self.broker.clone()), handler)
            .start()
            .await
            .unwrap()
    }

    pub fn record(&self, id: RecordId) -> OutboxRecord {
        self.ledger.get(id).unwrap()
    }

    pub fn all_produced(&self, ids: &[RecordId]) -> bool {
        ids.iter().all(|id| self.record(*id).produced_at().is_some())
    }

    pub fn all_processed(&self, ids: &[RecordId]) -> bool {
        ids.iter().all(|id| self.record(*id).is_processed())
    }

    /// Messages published for `id`, in append order.
    pub fn published_for(&self, id: RecordId) -> Vec<PublishedMessage> {
        self.broker
            .published()
            .into_iter()
            .filter(|m| decode(m).record_id == id)
            .collect()
    }
}

pub fn decode(message: &PublishedMessage) -> OutboxEnvelope {
    OutboxEnvelope::from_bytes(&message.payload).unwrap()
}

/// Poll `cond` every 10ms; false if it is still unmet after `within`.
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(within, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Async variant for conditions that need to query the control surface.
pub async fn wait_until_async<F, Fut>(within: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(within, async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Remembers every call; never fails.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<(HandlerContext, RecordId)>>,
}

impl RecordingHandler {
    pub fn handled(&self) -> Vec<(HandlerContext, RecordId)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        envelope: &OutboxEnvelope,
    ) -> Result<(), HandlerError> {
        self.seen.lock().push((*ctx, envelope.record_id));
        Ok(())
    }
}
