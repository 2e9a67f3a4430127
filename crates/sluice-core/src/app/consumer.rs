//! Consumer-group workers
//!
//! N members of one consumer group, each in its own task. Partition
//! assignment and redelivery are the broker's job; a worker only:
//! 1. polls the next delivery
//! 2. runs the `RecordHandler`
//! 3. on success enqueues `Received` and `Processed`, then acks
//! 4. on failure nacks (no status update), so the broker redelivers
//!
//! Shutdown follows the same watch-channel pattern as the dispatcher's
//! other loops: workers stop polling, leave the group and exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::coalescer::StatusCoalescer;
use crate::config::DispatcherConfig;
use crate::domain::{BrokerError, MemberId, OutboxEnvelope, PartitionId, StatusField};
use crate::ports::{BrokerConsumer, Clock, ConsumerGroupCoordinator, Delivery, IdGenerator};

/// Where a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerContext {
    pub member: MemberId,
    pub partition: PartitionId,
    pub offset: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Local handling of one delivered record (the consumer's side effects).
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        envelope: &OutboxEnvelope,
    ) -> Result<(), HandlerError>;
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    handler_failures: AtomicU64,
    decode_failures: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub handler_failures: u64,
    pub decode_failures: u64,
    pub acked: u64,
    pub nacked: u64,
}

/// Cloneable read side of the group's counters.
#[derive(Clone)]
pub struct ConsumerStatsHandle(Arc<Counters>);

impl ConsumerStatsHandle {
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.0.received.load(Ordering::Relaxed),
            handler_failures: self.0.handler_failures.load(Ordering::Relaxed),
            decode_failures: self.0.decode_failures.load(Ordering::Relaxed),
            acked: self.0.acked.load(Ordering::Relaxed),
            nacked: self.0.nacked.load(Ordering::Relaxed),
        }
    }
}

/// Running consumer group.
pub struct ConsumerGroup {
    members: Vec<MemberId>,
    joins: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl ConsumerGroup {
    /// Join `consumer_instance_count` members, then start one loop per member.
    ///
    /// All members join before any loop starts, so the first polls already
    /// see the settled assignment.
    pub async fn start(
        coordinator: Arc<dyn ConsumerGroupCoordinator>,
        handler: Arc<dyn RecordHandler>,
        coalescer: Arc<StatusCoalescer>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: &DispatcherConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, BrokerError> {
        let n = config.consumer_instance_count.max(1);
        let mut consumers = Vec::with_capacity(n);
        for _ in 0..n {
            let member = ids.generate_member_id();
            let consumer = coordinator
                .join(&config.topic, &config.consumer_group, member)
                .await?;
            consumers.push(consumer);
        }

        let counters = Arc::new(Counters::default());
        let members: Vec<MemberId> = consumers.iter().map(|c| c.member_id()).collect();
        let joins = consumers
            .into_iter()
            .map(|consumer| {
                let worker = Worker {
                    consumer,
                    handler: Arc::clone(&handler),
                    coalescer: Arc::clone(&coalescer),
                    clock: Arc::clone(&clock),
                    counters: Arc::clone(&counters),
                    poll_timeout: config.consumer_poll_timeout(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        info!(
            group = %config.consumer_group,
            topic = %config.topic,
            members = n,
            "consumer group started"
        );
        Ok(Self {
            members,
            joins,
            counters,
        })
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats_handle().stats()
    }

    pub fn stats_handle(&self) -> ConsumerStatsHandle {
        ConsumerStatsHandle(Arc::clone(&self.counters))
    }

    /// Wait for every worker; call after signalling shutdown.
    pub async fn join(&mut self) {
        for join in self.joins.drain(..) {
            if let Err(e) = join.await
                && !e.is_cancelled()
            {
                error!(error = %e, "consumer worker panicked");
            }
        }
    }

    pub fn abort(&mut self) {
        for join in self.joins.drain(..) {
            join.abort();
        }
    }
}

struct Worker {
    consumer: Box<dyn BrokerConsumer>,
    handler: Arc<dyn RecordHandler>,
    coalescer: Arc<StatusCoalescer>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    poll_timeout: std::time::Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let member = self.consumer.member_id();
        debug!(member = %member, partitions = ?self.consumer.assignment(), "consumer joined");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                polled = self.consumer.poll(self.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(delivery)) => self.process(member, delivery).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(member = %member, error = %e, "consumer poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_timeout) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        self.consumer.leave().await;
        info!(member = %member, "consumer left group");
    }

    async fn process(&self, member: MemberId, delivery: Delivery) {
        let envelope = match OutboxEnvelope::from_bytes(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    member = %member,
                    partition = %delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "undecodable delivery"
                );
                self.nack(member, &delivery).await;
                return;
            }
        };

        let ctx = HandlerContext {
            member,
            partition: delivery.partition,
            offset: delivery.offset,
            attempt: delivery.attempt,
        };
        let id = envelope.record_id;

        if let Err(e) = self.handler.handle(&ctx, &envelope).await {
            self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                member = %member,
                record_id = %id,
                attempt = delivery.attempt,
                error = %e,
                "handler failed, leaving delivery for redelivery"
            );
            self.nack(member, &delivery).await;
            return;
        }

        let now = self.clock.now();
        let queued = self
            .coalescer
            .enqueue(id, StatusField::Received, now)
            .and_then(|()| self.coalescer.enqueue(id, StatusField::Processed, now));
        if let Err(e) = queued {
            warn!(member = %member, record_id = %id, error = %e, "could not queue received status");
            self.nack(member, &delivery).await;
            return;
        }

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match self.consumer.ack(&delivery).await {
            Ok(()) => {
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(member = %member, record_id = %id, error = %e, "ack failed"),
        }
    }

    async fn nack(&self, member: MemberId, delivery: &Delivery) {
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.consumer.nack(delivery).await {
            warn!(member = %member, offset = delivery.offset, error = %e, "nack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GroupKey, NewOutboxRecord, OutboxRecord, RecordId};
    use crate::impls::{InMemoryBroker, InMemoryLedger};
    use crate::ports::{BrokerConnector, Ledger, SystemClock, UlidGenerator};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Fails the first attempt of every record in `flaky`.
    #[derive(Default)]
    struct FlakyHandler {
        flaky: HashSet<RecordId>,
        seen: Mutex<Vec<(RecordId, u32)>>,
    }

    #[async_trait]
    impl RecordHandler for FlakyHandler {
        async fn handle(
            &self,
            ctx: &HandlerContext,
            envelope: &OutboxEnvelope,
        ) -> Result<(), HandlerError> {
            self.seen.lock().push((envelope.record_id, ctx.attempt));
            if ctx.attempt == 1 && self.flaky.contains(&envelope.record_id) {
                return Err(HandlerError::new("downstream unavailable"));
            }
            Ok(())
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            consumer_instance_count: 2,
            consumer_poll_timeout_ms: 20,
            topic: "t".to_string(),
            ..DispatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn handled_records_queue_received_and_processed() {
        let config = config();
        let ledger = Arc::new(InMemoryLedger::new());
        let broker = InMemoryBroker::new(4);
        let coalescer = Arc::new(StatusCoalescer::new(
            ledger.clone(),
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
            &config,
        ));

        let id = ledger.insert(NewOutboxRecord::new(GroupKey::new("G1").unwrap(), 0, "p"));
        let flaky = ledger.insert(NewOutboxRecord::new(GroupKey::new("G2").unwrap(), 0, "p"));
        ledger
            .bulk_update_status(&[id, flaky], StatusField::Produced, Utc::now())
            .await
            .unwrap();

        let handler = Arc::new(FlakyHandler {
            flaky: HashSet::from([flaky]),
            ..FlakyHandler::default()
        });
        let (tx, rx) = watch::channel(false);
        let mut group = ConsumerGroup::start(
            Arc::new(broker.clone()),
            handler.clone(),
            coalescer.clone(),
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
            &config,
            rx,
        )
        .await
        .unwrap();
        assert_eq!(group.members().len(), 2);

        let producer = broker.connect().await.unwrap();
        for rid in [id, flaky] {
            let record: OutboxRecord = ledger.get(rid).unwrap();
            let payload = OutboxEnvelope::from_record(&record).to_bytes().unwrap();
            producer.send("t", &record.group_key, &payload).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while group.stats().received < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let stats = group.stats();
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 2);
        assert!(handler.seen.lock().contains(&(flaky, 2)));

        coalescer.flush().await.unwrap();
        for rid in [id, flaky] {
            let record = ledger.get(rid).unwrap();
            assert!(record.received_at.is_some());
            assert!(record.is_processed());
        }

        tx.send(true).unwrap();
        group.join().await;
        assert!(broker.group_members("t", &config.consumer_group).is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_is_nacked() {
        let mut config = config();
        config.consumer_instance_count = 1;
        let ledger = Arc::new(InMemoryLedger::new());
        let broker = InMemoryBroker::new(1).with_max_deliveries(1);
        let coalescer = Arc::new(StatusCoalescer::new(
            ledger.clone(),
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
            &config,
        ));
        let (tx, rx) = watch::channel(false);
        let mut group = ConsumerGroup::start(
            Arc::new(broker.clone()),
            Arc::new(FlakyHandler::default()),
            coalescer,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
            &config,
            rx,
        )
        .await
        .unwrap();

        let producer = broker.connect().await.unwrap();
        producer
            .send("t", &GroupKey::new("G1").unwrap(), b"garbage")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while group.stats().decode_failures < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(group.stats().received, 0);

        tx.send(true).unwrap();
        group.join().await;
        assert_eq!(broker.dead_letters("t", &config.consumer_group).len(), 1);
    }
}
