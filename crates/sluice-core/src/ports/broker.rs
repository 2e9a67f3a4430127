//! Broker ports - publish / consume の抽象化
//!
//! - Publish: `BrokerConnection::send(topic, key, payload) -> Ack`
//! - Consume: `ConsumerGroupCoordinator::join` gives a `BrokerConsumer`;
//!   partition assignment and redelivery belong to the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BrokerError, GroupKey, MemberId, PartitionId};

/// Broker acknowledgment of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: PartitionId,
    pub offset: u64,
}

/// One producer connection (a "handle" in the client pool).
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Send one message keyed by group; resolves once the broker acks.
    async fn send(&self, topic: &str, key: &GroupKey, payload: &[u8]) -> Result<Ack, BrokerError>;

    /// Push out anything buffered client-side.
    async fn flush(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Opens producer connections; the pool calls this once per handle.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A record delivered to a consumer-group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: PartitionId,
    pub offset: u64,
    pub key: GroupKey,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
}

/// One member of a consumer group.
///
/// A delivery that is neither acked nor nacked stays outstanding; the
/// broker redelivers it if the member leaves.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    fn member_id(&self) -> MemberId;

    /// Next delivery from an assigned partition, or `None` on timeout.
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Handling failed; ask the broker to redeliver.
    async fn nack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Partitions currently assigned to this member.
    fn assignment(&self) -> Vec<PartitionId>;

    async fn leave(&self);
}

#[async_trait]
pub trait ConsumerGroupCoordinator: Send + Sync {
    async fn join(
        &self,
        topic: &str,
        group: &str,
        member: MemberId,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}
