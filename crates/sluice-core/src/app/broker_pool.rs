//! BrokerClientPool - 送信ハンドルのプールと backpressure
//!
//! # 設計
//! - `pool_size` handles, each with its own connection and a FIFO worker task
//! - each handle admits at most `max_producer_buffer` unacknowledged sends
//!   (a semaphore permit travels with the send and is released on ack/error)
//! - routing: while a group key has `PendingAck`s alive on a handle, new
//!   sends for that key go to the same handle (keeps per-group order);
//!   otherwise the least-loaded handle wins. The route is held until the
//!   caller drops the `PendingAck`, so a group only moves once every earlier
//!   completion has been handled
//! - `submit` suspends when the target handle is full; it never drops or
//!   errors because of load
//! - a send the broker does not answer within `send_timeout` fails with
//!   `BrokerError::Timeout`, so one hung send cannot hold a handle forever
//! - no retries here: a failed send is reported to the caller as-is

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::domain::{BrokerError, GroupKey, OutboxEnvelope, OutboxRecord, RecordId};
use crate::ports::{Ack, BrokerConnection, BrokerConnector};

struct SendJob {
    record_id: RecordId,
    key: GroupKey,
    payload: Vec<u8>,
    _permit: OwnedSemaphorePermit,
    reply: oneshot::Sender<Result<Ack, BrokerError>>,
}

struct Handle {
    connection: Arc<dyn BrokerConnection>,
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    tx: Mutex<Option<mpsc::UnboundedSender<SendJob>>>,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    handle: usize,
    outstanding: usize,
}

struct PoolShared {
    routes: Mutex<HashMap<GroupKey, Route>>,
    space_freed: Notify,
    closed: AtomicBool,
}

impl PoolShared {
    fn release_route(&self, key: &GroupKey) {
        {
            let mut routes = self.routes.lock();
            if let Some(route) = routes.get_mut(key) {
                route.outstanding = route.outstanding.saturating_sub(1);
                if route.outstanding == 0 {
                    routes.remove(key);
                }
            }
        }
        // a sticky submitter may now pick another handle
        self.space_freed.notify_waiters();
    }
}

/// Completion of one submitted send.
///
/// Keeps the group's route pinned to `handle` until dropped.
pub struct PendingAck {
    pub record_id: RecordId,
    pub group_key: GroupKey,
    pub handle: usize,
    rx: Option<oneshot::Receiver<Result<Ack, BrokerError>>>,
    shared: Arc<PoolShared>,
}

impl PendingAck {
    /// Resolves once the broker acked or the send failed. A send dropped
    /// during drain resolves to `BrokerError::Abandoned`, and so does a
    /// second call.
    pub async fn wait(&mut self) -> Result<Ack, BrokerError> {
        let Some(rx) = self.rx.take() else {
            return Err(BrokerError::Abandoned);
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Abandoned),
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.shared.release_route(&self.group_key);
    }
}

impl std::fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAck")
            .field("record_id", &self.record_id)
            .field("group_key", &self.group_key)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Sends still outstanding when the drain timeout hit.
    pub abandoned: usize,
}

pub struct BrokerClientPool {
    topic: String,
    handles: Vec<Handle>,
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_buffer: usize,
}

impl BrokerClientPool {
    /// Open `pool_size` connections and start one send worker per handle.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        config: &DispatcherConfig,
    ) -> Result<Self, BrokerError> {
        let shared = Arc::new(PoolShared {
            routes: Mutex::new(HashMap::new()),
            space_freed: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let pool_size = config.pool_size.max(1);
        let max_buffer = config.max_producer_buffer.max(1);
        let mut handles = Vec::with_capacity(pool_size);
        let mut workers = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let connection = connector.connect().await?;
            let (tx, rx) = mpsc::unbounded_channel();
            let outstanding = Arc::new(AtomicUsize::new(0));

            workers.push(tokio::spawn(handle_worker(
                index,
                config.topic.clone(),
                config.send_timeout(),
                Arc::clone(&connection),
                rx,
                Arc::clone(&shared),
                Arc::clone(&outstanding),
            )));
            handles.push(Handle {
                connection,
                permits: Arc::new(Semaphore::new(max_buffer)),
                outstanding,
                tx: Mutex::new(Some(tx)),
            });
        }

        info!(
            topic = %config.topic,
            pool_size,
            max_producer_buffer = max_buffer,
            send_timeout_ms = config.send_timeout_ms,
            "broker client pool connected"
        );
        Ok(Self {
            topic: config.topic.clone(),
            handles,
            shared,
            workers: Mutex::new(workers),
            max_buffer,
        })
    }

    /// Hand one record to a handle. Suspends while the chosen handle is full.
    pub async fn submit(&self, record: &OutboxRecord) -> Result<PendingAck, BrokerError> {
        let payload = OutboxEnvelope::from_record(record)
            .to_bytes()
            .map_err(|e| BrokerError::Encode(e.to_string()))?;
        let key = record.group_key.clone();

        loop {
            let space_freed = self.shared.space_freed.notified();
            tokio::pin!(space_freed);
            space_freed.as_mut().enable();

            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::PoolClosed);
            }

            {
                let mut routes = self.shared.routes.lock();
                let reserved = match routes.get(&key) {
                    // sticky: must wait for this handle even if others have room
                    Some(route) => self
                        .try_reserve(route.handle)
                        .map(|permit| (route.handle, permit)),
                    None => self.least_loaded().and_then(|index| {
                        self.try_reserve(index).map(|permit| (index, permit))
                    }),
                };

                if let Some((index, permit)) = reserved {
                    let (reply, rx) = oneshot::channel();
                    let job = SendJob {
                        record_id: record.id,
                        key: key.clone(),
                        payload,
                        _permit: permit,
                        reply,
                    };
                    let handle = &self.handles[index];
                    let tx = handle.tx.lock();
                    let Some(tx) = tx.as_ref() else {
                        return Err(BrokerError::PoolClosed);
                    };
                    if tx.send(job).is_err() {
                        return Err(BrokerError::PoolClosed);
                    }
                    handle.outstanding.fetch_add(1, Ordering::SeqCst);
                    routes
                        .entry(key.clone())
                        .or_insert(Route {
                            handle: index,
                            outstanding: 0,
                        })
                        .outstanding += 1;

                    return Ok(PendingAck {
                        record_id: record.id,
                        group_key: key,
                        handle: index,
                        rx: Some(rx),
                        shared: Arc::clone(&self.shared),
                    });
                }
            }

            debug!(record_id = %record.id, group_key = %key, "broker pool saturated, waiting");
            space_freed.await;
        }
    }

    fn try_reserve(&self, index: usize) -> Option<OwnedSemaphorePermit> {
        self.handles
            .get(index)
            .and_then(|h| Arc::clone(&h.permits).try_acquire_owned().ok())
    }

    fn least_loaded(&self) -> Option<usize> {
        self.handles
            .iter()
            .enumerate()
            .filter(|(_, h)| h.permits.available_permits() > 0)
            .max_by_key(|(index, h)| (h.permits.available_permits(), std::cmp::Reverse(*index)))
            .map(|(index, _)| index)
    }

    /// Push out client-side buffers on every handle.
    pub async fn flush(&self) {
        for (index, handle) in self.handles.iter().enumerate() {
            if let Err(e) = handle.connection.flush().await {
                warn!(handle = index, error = %e, "broker handle flush failed");
            }
        }
    }

    /// Stop accepting sends and wait for outstanding ones, up to `timeout`.
    /// Whatever is still outstanding after that is abandoned.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.space_freed.notify_waiters();

        // closing the queues lets each worker finish what it already has
        for handle in &self.handles {
            handle.tx.lock().take();
        }

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut abandoned = 0;
        for (index, mut worker) in workers.into_iter().enumerate() {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
                let left = self
                    .handles
                    .get(index)
                    .map(|h| h.outstanding.swap(0, Ordering::SeqCst))
                    .unwrap_or(0);
                abandoned += left;
                warn!(handle = index, abandoned = left, "drain timed out, abandoning sends");
            }
        }
        for handle in &self.handles {
            handle.permits.close();
        }

        self.flush().await;
        info!(topic = %self.topic, abandoned, "broker client pool drained");
        DrainReport { abandoned }
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Max unacknowledged sends per handle.
    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }

    pub fn outstanding(&self) -> usize {
        self.handles
            .iter()
            .map(|h| h.outstanding.load(Ordering::SeqCst))
            .sum()
    }

    pub fn outstanding_per_handle(&self) -> Vec<usize> {
        self.handles
            .iter()
            .map(|h| h.outstanding.load(Ordering::SeqCst))
            .collect()
    }

    /// Max sends outstanding across all handles.
    pub fn capacity(&self) -> usize {
        self.handles.len() * self.max_buffer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Kill workers without waiting; queued sends resolve as abandoned.
    pub fn abort(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        self.shared.space_freed.notify_waiters();
    }
}

async fn handle_worker(
    index: usize,
    topic: String,
    send_timeout: Duration,
    connection: Arc<dyn BrokerConnection>,
    mut rx: mpsc::UnboundedReceiver<SendJob>,
    shared: Arc<PoolShared>,
    outstanding: Arc<AtomicUsize>,
) {
    while let Some(job) = rx.recv().await {
        let send = connection.send(&topic, &job.key, &job.payload);
        let result = match tokio::time::timeout(send_timeout, send).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    handle = index,
                    record_id = %job.record_id,
                    group_key = %job.key,
                    timeout_ms = send_timeout.as_millis() as u64,
                    "broker send timed out"
                );
                Err(BrokerError::Timeout(send_timeout))
            }
        };
        if let Err(e) = &result {
            debug!(handle = index, record_id = %job.record_id, error = %e, "send failed");
        }

        // saturating: drain may already have zeroed the counter
        let _ = outstanding.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some(n.saturating_sub(1))
        });
        let SendJob { reply, _permit, .. } = job;
        drop(_permit);
        shared.space_freed.notify_waiters();
        let _ = reply.send(result);
    }
    debug!(handle = index, "broker handle worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewOutboxRecord;
    use crate::impls::InMemoryBroker;
    use chrono::Utc;

    fn config(pool_size: usize, max_producer_buffer: usize) -> DispatcherConfig {
        DispatcherConfig {
            pool_size,
            max_producer_buffer,
            topic: "t".to_string(),
            ..DispatcherConfig::default()
        }
    }

    fn record(id: i64, group: &str, rank: i64) -> OutboxRecord {
        OutboxRecord::new(
            RecordId::new(id),
            NewOutboxRecord::new(GroupKey::new(group).unwrap(), rank, format!("p{id}")),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn acks_resolve_per_record() {
        let broker = InMemoryBroker::new(4);
        let pool = BrokerClientPool::connect(&broker, &config(2, 4)).await.unwrap();

        let mut pending = pool.submit(&record(1, "A", 0)).await.unwrap();
        let ack = pending.wait().await.unwrap();
        assert_eq!(ack.partition, broker.partition_for(&GroupKey::new("A").unwrap()));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_suspends_instead_of_failing() {
        let broker = InMemoryBroker::new(4);
        let pool = Arc::new(BrokerClientPool::connect(&broker, &config(2, 2)).await.unwrap());
        assert_eq!(pool.capacity(), 4);
        broker.hold_sends();

        let mut pending = Vec::new();
        for i in 0..4 {
            pending.push(pool.submit(&record(i, &format!("G{i}"), 0)).await.unwrap());
        }
        assert_eq!(pool.outstanding(), 4);

        let fifth = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.submit(&record(99, "G99", 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fifth.is_finished(), "fifth submit should be suspended");

        broker.release_sends();
        for mut p in pending {
            p.wait().await.unwrap();
        }
        let mut fifth = fifth.await.unwrap().unwrap();
        fifth.wait().await.unwrap();
        assert_eq!(broker.published_count(), 5);
    }

    #[tokio::test]
    async fn one_group_sticks_to_one_handle_in_order() {
        let broker = InMemoryBroker::new(4);
        let pool = BrokerClientPool::connect(&broker, &config(4, 64)).await.unwrap();
        broker.hold_sends();

        let mut pending = Vec::new();
        for rank in 0..20 {
            pending.push(pool.submit(&record(rank + 1, "G1", rank)).await.unwrap());
        }
        let handle = pending[0].handle;
        assert!(pending.iter().all(|p| p.handle == handle));

        broker.release_sends();
        let mut offsets = Vec::new();
        for mut p in pending {
            offsets.push(p.wait().await.unwrap().offset);
        }
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
    }

    #[tokio::test]
    async fn connection_failures_surface_per_record() {
        let broker = InMemoryBroker::new(4);
        let pool = BrokerClientPool::connect(&broker, &config(1, 4)).await.unwrap();
        broker.fail_sends_for(GroupKey::new("BAD").unwrap());

        let mut bad = pool.submit(&record(1, "BAD", 0)).await.unwrap();
        let mut good = pool.submit(&record(2, "GOOD", 0)).await.unwrap();
        assert!(matches!(bad.wait().await, Err(BrokerError::Rejected(_))));
        assert!(good.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_abandons_what_cannot_finish() {
        let broker = InMemoryBroker::new(4);
        let pool = BrokerClientPool::connect(&broker, &config(1, 4)).await.unwrap();
        broker.hold_sends();

        let mut stuck = pool.submit(&record(1, "A", 0)).await.unwrap();
        let report = pool.drain(Duration::from_millis(50)).await;

        assert_eq!(report.abandoned, 1);
        assert_eq!(stuck.wait().await, Err(BrokerError::Abandoned));
        assert_eq!(
            pool.submit(&record(2, "A", 1)).await.unwrap_err(),
            BrokerError::PoolClosed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_send_times_out_and_frees_the_handle() {
        let broker = InMemoryBroker::new(4);
        let config = DispatcherConfig {
            send_timeout_ms: 100,
            ..config(1, 1)
        };
        let pool = BrokerClientPool::connect(&broker, &config).await.unwrap();
        broker.hold_sends();

        let mut hung = pool.submit(&record(1, "A", 0)).await.unwrap();
        assert_eq!(
            hung.wait().await,
            Err(BrokerError::Timeout(Duration::from_millis(100)))
        );
        assert_eq!(pool.outstanding(), 0);
        drop(hung);

        broker.release_sends();
        let mut next = pool.submit(&record(2, "B", 0)).await.unwrap();
        assert!(next.wait().await.is_ok());
    }

    #[tokio::test]
    async fn group_stays_on_its_handle_until_the_ack_is_dropped() {
        let broker = InMemoryBroker::new(4);
        let pool = BrokerClientPool::connect(&broker, &config(2, 4)).await.unwrap();

        let mut a0 = pool.submit(&record(1, "A", 0)).await.unwrap();
        a0.wait().await.unwrap();
        assert_eq!(pool.outstanding(), 0);

        broker.hold_sends();
        let b0 = pool.submit(&record(2, "B", 0)).await.unwrap();
        assert_eq!(b0.handle, a0.handle);

        // the send is done but its completion is still held: A keeps its handle
        let a1 = pool.submit(&record(3, "A", 1)).await.unwrap();
        assert_eq!(a1.handle, a0.handle);
        assert_eq!(pool.outstanding_per_handle()[a0.handle], 2);

        drop(a0);
        drop(a1);
        let a2 = pool.submit(&record(4, "A", 2)).await.unwrap();
        assert_ne!(a2.handle, b0.handle, "A moves to the less loaded handle");
        broker.release_sends();
    }
}
