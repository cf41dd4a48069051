//! Queue transport abstraction.

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::MessageEnvelope;

/// Transport failure, classified structurally (no string matching).
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("broker operation timed out: {0}")]
    Timeout(String),

    #[error("broker connection reset: {0}")]
    ConnectionReset(String),

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Publish was sent but the broker did not confirm receipt.
    #[error("publish not confirmed: {0}")]
    NotConfirmed(String),

    /// The queue was closed (shutdown); consumers should stop.
    #[error("queue closed")]
    Closed,

    #[error("broker error: {0}")]
    Other(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::Timeout(_) | QueueError::ConnectionReset(_) | QueueError::Unreachable(_)
        )
    }
}

/// Identifies one delivery for acknowledgment.
///
/// Tags are scoped to the queue instance that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub(crate) String);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivered message, unacknowledged until [`ReportQueue::ack`].
#[derive(Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub envelope: MessageEnvelope,
}

/// Durable queue: confirmed publish, prefetch-bounded consume, explicit ack.
///
/// Delivery is at-least-once: an unacked message is redelivered, so consumers
/// must tolerate duplicates. No ordering is guaranteed between distinct
/// messages, nor between an original delivery and its requeued retry.
#[async_trait]
pub trait ReportQueue: Send + Sync {
    /// Confirmed publish: returns only once the broker has acknowledged
    /// receipt. Failures propagate to the caller, never silently swallowed.
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), QueueError>;

    /// Next delivery. Waits until a message is available and a prefetch slot
    /// is free; at most `prefetch` deliveries are unacked at any time.
    /// Returns [`QueueError::Closed`] once the queue shuts down.
    async fn consume(&self) -> Result<Delivery, QueueError>;

    /// Acknowledge a delivery, freeing its prefetch slot.
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError>;

    /// Close the queue: wake pending consumers with [`QueueError::Closed`]
    /// and release transport resources.
    async fn close(&self);
}

#[async_trait]
impl<Q> ReportQueue for std::sync::Arc<Q>
where
    Q: ReportQueue + ?Sized,
{
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), QueueError> {
        (**self).publish(envelope).await
    }

    async fn consume(&self) -> Result<Delivery, QueueError> {
        (**self).consume().await
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        (**self).ack(tag).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
