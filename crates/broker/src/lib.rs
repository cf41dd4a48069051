//! `salesfeed-broker` — durable queue transport for report messages.
//!
//! The [`ReportQueue`] trait is the seam between the pipeline and the broker:
//! confirmed publish, prefetch-bounded consume, explicit ack. The in-memory
//! implementation backs tests and single-process deployments; the Redis
//! Streams implementation (feature `redis`) is the networked backend.

pub mod envelope;
pub mod memory;
pub mod queue;

#[cfg(feature = "redis")]
pub mod redis_queue;

pub use envelope::{MessageEnvelope, RETRY_ATTEMPT_HEADER};
pub use memory::InMemoryQueue;
pub use queue::{Delivery, DeliveryTag, QueueError, ReportQueue};

#[cfg(feature = "redis")]
pub use redis_queue::{ChannelManager, RedisQueue};
