//! InMemoryBroker - 開発用・テスト用のメッセージブローカー
//!
//! Partitioned topics with consumer groups, enough to exercise the
//! dispatcher end to end:
//! - partition = FNV-1a(key) % partitions, so one group key always lands
//!   on one partition
//! - consumer groups: partitions are spread over members in join order
//!   (`p % members`) and rebalanced on join/leave
//! - unacked deliveries of a member that leaves (or is dropped) are
//!   redelivered; nack redelivers immediately with `attempt + 1`
//! - after `max_deliveries` attempts a delivery is parked in the group's
//!   dead-letter list
//!
//! # Fault injection
//! - `fail_sends_for(key)`: sends for that key are rejected
//! - `hold_sends()` / `release_sends()`: sends block until released
//! - `disconnect()` / `reconnect()`: connection-level failures
//! - `with_failure_rate(p)`: each send fails with probability `p`

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};

use crate::domain::{BrokerError, GroupKey, MemberId, PartitionId};
use crate::ports::{
    Ack, BrokerConnection, BrokerConnector, BrokerConsumer, ConsumerGroupCoordinator, Delivery,
};

pub const DEFAULT_PARTITIONS: u32 = 6;
pub const DEFAULT_MAX_DELIVERIES: u32 = 10;

/// One message as appended to a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: u64,
    pub key: GroupKey,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    key: GroupKey,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Join order; drives the assignment.
    members: Vec<MemberId>,
    assignment: HashMap<MemberId, Vec<PartitionId>>,
    /// Next never-delivered offset per partition.
    cursors: Vec<u64>,
    /// Deliveries to hand out again, per partition: (offset, attempt).
    redeliver: Vec<VecDeque<(u64, u32)>>,
    /// (partition, offset) -> (member, attempt)
    in_flight: HashMap<(PartitionId, u64), (MemberId, u32)>,
    dead_letters: Vec<(PartitionId, u64)>,
    /// Per-member round-robin position over its assigned partitions.
    poll_position: HashMap<MemberId, usize>,
}

impl GroupState {
    fn new(partitions: u32) -> Self {
        Self {
            cursors: vec![0; partitions as usize],
            redeliver: (0..partitions).map(|_| VecDeque::new()).collect(),
            ..Self::default()
        }
    }

    fn rebalance(&mut self, partitions: u32) {
        self.assignment.clear();
        if self.members.is_empty() {
            return;
        }
        for member in &self.members {
            self.assignment.insert(*member, Vec::new());
        }
        let n = self.members.len() as u32;
        for p in 0..partitions {
            let owner = self.members[(p % n) as usize];
            if let Some(parts) = self.assignment.get_mut(&owner) {
                parts.push(PartitionId::new(p));
            }
        }
    }

    fn requeue(&mut self, partition: PartitionId, offset: u64, attempt: u32, max_deliveries: u32) {
        if attempt >= max_deliveries {
            self.dead_letters.push((partition, offset));
        } else if let Some(queue) = self.redeliver.get_mut(partition.get() as usize) {
            queue.push_front((offset, attempt));
        }
    }

    fn remove_member(&mut self, member: MemberId, partitions: u32, max_deliveries: u32) {
        self.members.retain(|m| *m != member);
        self.poll_position.remove(&member);

        let orphaned: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| *owner == member)
            .map(|(key, (_, attempt))| (*key, *attempt))
            .collect();
        for ((partition, offset), attempt) in orphaned {
            self.in_flight.remove(&(partition, offset));
            self.requeue(partition, offset, attempt, max_deliveries);
        }
        self.rebalance(partitions);
    }
}

#[derive(Debug, Default)]
struct Topic {
    logs: Vec<Vec<StoredMessage>>,
    groups: HashMap<String, GroupState>,
}

impl Topic {
    fn new(partitions: u32) -> Self {
        Self {
            logs: (0..partitions).map(|_| Vec::new()).collect(),
            groups: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    published: Vec<PublishedMessage>,
    failing_keys: HashSet<GroupKey>,
    disconnected: bool,
    failure_rate: f64,
}

impl BrokerState {
    fn topic(&mut self, name: &str, partitions: u32) -> &mut Topic {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(partitions))
    }
}

struct BrokerInner {
    partitions: u32,
    max_deliveries: u32,
    state: Mutex<BrokerState>,
    /// New messages, redeliveries or rebalances.
    activity: Notify,
    /// `true` = sends may proceed.
    send_gate: watch::Sender<bool>,
}

/// Shared handle; clones talk to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

/// FNV-1a over the key bytes.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl InMemoryBroker {
    pub fn new(partitions: u32) -> Self {
        let (send_gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(BrokerInner {
                partitions: partitions.max(1),
                max_deliveries: DEFAULT_MAX_DELIVERIES,
                state: Mutex::new(BrokerState::default()),
                activity: Notify::new(),
                send_gate,
            }),
        }
    }

    /// Must be called before the broker is shared.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.max_deliveries = max_deliveries.max(1);
        }
        self
    }

    pub fn with_failure_rate(self, rate: f64) -> Self {
        self.inner.state.lock().failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    pub fn partition_for(&self, key: &GroupKey) -> PartitionId {
        let p = fnv1a(key.as_str().as_bytes()) % u64::from(self.inner.partitions);
        PartitionId::new(p as u32)
    }

    /// Every message appended so far, in append order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().published.clone()
    }

    pub fn published_count(&self) -> usize {
        self.inner.state.lock().published.len()
    }

    pub fn fail_sends_for(&self, key: GroupKey) {
        self.inner.state.lock().failing_keys.insert(key);
    }

    pub fn clear_send_failures(&self) {
        self.inner.state.lock().failing_keys.clear();
    }

    pub fn hold_sends(&self) {
        self.inner.send_gate.send_replace(false);
    }

    pub fn release_sends(&self) {
        self.inner.send_gate.send_replace(true);
    }

    pub fn disconnect(&self) {
        self.inner.state.lock().disconnected = true;
    }

    pub fn reconnect(&self) {
        self.inner.state.lock().disconnected = false;
    }

    pub fn assignment_of(&self, topic: &str, group: &str, member: MemberId) -> Vec<PartitionId> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .and_then(|g| g.assignment.get(&member))
            .cloned()
            .unwrap_or_default()
    }

    pub fn group_members(&self, topic: &str, group: &str) -> Vec<MemberId> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self, topic: &str, group: &str) -> Vec<(PartitionId, u64)> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.dead_letters.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

struct InMemoryProducer {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnection for InMemoryProducer {
    async fn send(&self, topic: &str, key: &GroupKey, payload: &[u8]) -> Result<Ack, BrokerError> {
        let inner = &self.broker.inner;
        let mut gate = inner.send_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(BrokerError::Connection("broker shut down".to_string()));
        }

        let partition = self.broker.partition_for(key);
        let ack = {
            let mut state = inner.state.lock();
            if state.disconnected {
                return Err(BrokerError::Connection("broker unreachable".to_string()));
            }
            if state.failing_keys.contains(key) {
                return Err(BrokerError::Rejected(format!("sends for {key} are failing")));
            }
            if state.failure_rate > 0.0 && rand::random::<f64>() < state.failure_rate {
                return Err(BrokerError::Connection("injected send failure".to_string()));
            }

            let log = state
                .topic(topic, inner.partitions)
                .logs
                .get_mut(partition.get() as usize)
                .ok_or_else(|| BrokerError::Rejected(format!("no partition {partition}")))?;
            let offset = log.len() as u64;
            log.push(StoredMessage {
                key: key.clone(),
                payload: payload.to_vec(),
            });
            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.clone(),
                payload: payload.to_vec(),
            });
            Ack { partition, offset }
        };
        inner.activity.notify_waiters();
        Ok(ack)
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        if self.inner.state.lock().disconnected {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        Ok(Arc::new(InMemoryProducer {
            broker: self.clone(),
        }))
    }
}

#[async_trait]
impl ConsumerGroupCoordinator for InMemoryBroker {
    async fn join(
        &self,
        topic: &str,
        group: &str,
        member: MemberId,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                return Err(BrokerError::Connection("broker unreachable".to_string()));
            }
            let partitions = self.inner.partitions;
            let group_state = state
                .topic(topic, partitions)
                .groups
                .entry(group.to_string())
                .or_insert_with(|| GroupState::new(partitions));
            if !group_state.members.contains(&member) {
                group_state.members.push(member);
            }
            group_state.rebalance(partitions);
        }
        self.inner.activity.notify_waiters();

        Ok(Box::new(InMemoryConsumer {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.to_string(),
            member,
        }))
    }
}

/// One consumer-group member. Dropping it leaves the group.
struct InMemoryConsumer {
    inner: Arc<BrokerInner>,
    topic: String,
    group: String,
    member: MemberId,
}

impl InMemoryConsumer {
    fn try_take(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.inner.state.lock();
        let Some(topic) = state.topics.get_mut(&self.topic) else {
            return Ok(None);
        };
        let Topic { logs, groups } = topic;
        let group = groups
            .get_mut(&self.group)
            .ok_or_else(|| BrokerError::Connection(format!("group {} is gone", self.group)))?;
        let Some(assigned) = group.assignment.get(&self.member).cloned() else {
            return Err(BrokerError::Connection(format!(
                "{} is not a member of {}",
                self.member, self.group
            )));
        };
        if assigned.is_empty() {
            return Ok(None);
        }

        let start = group.poll_position.get(&self.member).copied().unwrap_or(0);
        for step in 0..assigned.len() {
            let partition = assigned[(start + step) % assigned.len()];
            let p = partition.get() as usize;
            let Some(log) = logs.get(p) else { continue };

            let next = match group.redeliver[p].pop_front() {
                Some((offset, attempt)) => Some((offset, attempt + 1)),
                None if (group.cursors[p] as usize) < log.len() => {
                    let offset = group.cursors[p];
                    group.cursors[p] += 1;
                    Some((offset, 1))
                }
                None => None,
            };
            let Some((offset, attempt)) = next else { continue };
            let Some(message) = log.get(offset as usize) else { continue };

            group
                .in_flight
                .insert((partition, offset), (self.member, attempt));
            group
                .poll_position
                .insert(self.member, (start + step + 1) % assigned.len());
            return Ok(Some(Delivery {
                partition,
                offset,
                key: message.key.clone(),
                payload: message.payload.clone(),
                attempt,
            }));
        }
        Ok(None)
    }

    fn leave_group(&self) {
        {
            let mut state = self.inner.state.lock();
            let partitions = self.inner.partitions;
            let max_deliveries = self.inner.max_deliveries;
            if let Some(group) = state
                .topics
                .get_mut(&self.topic)
                .and_then(|t| t.groups.get_mut(&self.group))
            {
                group.remove_member(self.member, partitions, max_deliveries);
            }
        }
        self.inner.activity.notify_waiters();
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    fn member_id(&self) -> MemberId {
        self.member
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // register interest before looking, so a send in between is not missed
            let notified = self.inner.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        if let Some(group) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.groups.get_mut(&self.group))
        {
            group.in_flight.remove(&(delivery.partition, delivery.offset));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.state.lock();
            let max_deliveries = self.inner.max_deliveries;
            if let Some(group) = state
                .topics
                .get_mut(&self.topic)
                .and_then(|t| t.groups.get_mut(&self.group))
                && let Some((_, attempt)) = group
                    .in_flight
                    .remove(&(delivery.partition, delivery.offset))
            {
                group.requeue(delivery.partition, delivery.offset, attempt, max_deliveries);
            }
        }
        self.inner.activity.notify_waiters();
        Ok(())
    }

    fn assignment(&self) -> Vec<PartitionId> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(&self.topic)
            .and_then(|t| t.groups.get(&self.group))
            .and_then(|g| g.assignment.get(&self.member))
            .cloned()
            .unwrap_or_default()
    }

    async fn leave(&self) {
        self.leave_group();
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.leave_group();
    }
}
