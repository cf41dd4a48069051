//! Redis Streams-backed queue (durable, at-least-once delivery).
//!
//! - **Stream key** = the queue name; streams survive broker restarts.
//! - **Confirmed publish**: XADD returns the entry id only after Redis has
//!   persisted the entry; the id is the broker acknowledgment.
//! - **Consumer group** (XREADGROUP/XACK) gives per-delivery acks; unacked
//!   entries stay pending and are redelivered.
//!
//! The connection is created lazily on first use and cached process-wide by
//! [`ChannelManager`]. Any command failure invalidates the cache so the next
//! operation reconnects from scratch; there is no background reconnect loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::envelope::MessageEnvelope;
use crate::queue::{Delivery, DeliveryTag, QueueError, ReportQueue};

const CONSUMER_GROUP: &str = "salesfeed";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn map_redis_error(op: &str, e: redis::RedisError) -> QueueError {
    if e.is_timeout() {
        QueueError::Timeout(format!("{op}: {e}"))
    } else if e.is_connection_dropped() {
        QueueError::ConnectionReset(format!("{op}: {e}"))
    } else if e.is_connection_refusal() {
        QueueError::Unreachable(format!("{op}: {e}"))
    } else {
        QueueError::Other(format!("{op}: {e}"))
    }
}

/// Owns the lazily-created, process-wide broker connection.
///
/// Only one "current" connection exists at a time; [`invalidate`] replaces it
/// wholesale and the next [`channel`] call re-establishes. This is the owned
/// rendition of a module-global cached channel: callers share the manager by
/// reference instead of reaching for ambient state.
///
/// [`invalidate`]: ChannelManager::invalidate
/// [`channel`]: ChannelManager::channel
#[derive(Debug)]
pub struct ChannelManager {
    client: redis::Client,
    current: Mutex<Option<MultiplexedConnection>>,
}

impl ChannelManager {
    /// Validate the broker URL and prepare the manager. Does not connect yet.
    pub fn new(broker_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(broker_url)
            .map_err(|e| QueueError::Other(format!("invalid broker url: {e}")))?;
        Ok(Self {
            client,
            current: Mutex::new(None),
        })
    }

    /// The current connection, establishing it if needed.
    pub async fn channel(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut guard = self.current.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection; the next [`channel`] call reconnects.
    ///
    /// [`channel`]: ChannelManager::channel
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

/// Redis Streams queue.
pub struct RedisQueue {
    manager: Arc<ChannelManager>,
    queue_name: String,
    consumer_name: String,
    prefetch: Arc<Semaphore>,
    group_ready: AtomicBool,
    closed: AtomicBool,
    unacked: std::sync::Mutex<HashMap<DeliveryTag, OwnedSemaphorePermit>>,
}

impl RedisQueue {
    pub fn new(
        manager: Arc<ChannelManager>,
        queue_name: impl Into<String>,
        prefetch: usize,
    ) -> Self {
        Self {
            manager,
            queue_name: queue_name.into(),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            prefetch: Arc::new(Semaphore::new(prefetch.max(1))),
            group_ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            unacked: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Declare the queue (idempotent). XGROUP CREATE with MKSTREAM creates
    /// the stream if absent; BUSYGROUP means it already exists.
    async fn ensure_group(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        if self.group_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.queue_name)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(map_redis_error("declare queue", e)),
        }
        self.group_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_one(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<(String, MessageEnvelope)>, QueueError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.queue_name)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("consume", e))?;

        parse_single_entry(reply)
    }
}

/// Pull `(entry_id, envelope)` out of an XREADGROUP reply.
///
/// Reply shape: `[[stream_key, [[entry_id, [field, value, ...]], ...]], ...]`;
/// `Nil` when no entry was available.
fn parse_single_entry(reply: redis::Value) -> Result<Option<(String, MessageEnvelope)>, QueueError> {
    use redis::Value;

    let malformed = || QueueError::Other("malformed XREADGROUP reply".into());

    let streams = match reply {
        Value::Nil => return Ok(None),
        Value::Bulk(streams) => streams,
        _ => return Err(malformed()),
    };
    let Some(Value::Bulk(stream)) = streams.into_iter().next() else {
        return Ok(None);
    };
    // stream = [key, entries]
    let mut parts = stream.into_iter();
    let _key = parts.next();
    let Some(Value::Bulk(entries)) = parts.next() else {
        return Err(malformed());
    };
    let Some(Value::Bulk(entry)) = entries.into_iter().next() else {
        return Ok(None);
    };

    let mut entry = entry.into_iter();
    let Some(Value::Data(id)) = entry.next() else {
        return Err(malformed());
    };
    let id = String::from_utf8_lossy(&id).to_string();
    let Some(Value::Bulk(fields)) = entry.next() else {
        return Err(malformed());
    };

    let mut body: Vec<u8> = Vec::new();
    let mut headers = std::collections::BTreeMap::new();
    let mut kind = None;
    let mut content_type = None;

    for pair in fields.chunks(2) {
        let [Value::Data(name), Value::Data(value)] = pair else {
            continue;
        };
        match name.as_slice() {
            b"body" => body = value.clone(),
            b"headers" => {
                headers = serde_json::from_slice(value).unwrap_or_default();
            }
            b"kind" => kind = Some(String::from_utf8_lossy(value).to_string()),
            b"content-type" => {
                content_type = Some(String::from_utf8_lossy(value).to_string());
            }
            _ => {}
        }
    }

    let envelope = MessageEnvelope {
        body,
        headers,
        kind,
        content_type,
        persistent: true,
    };
    Ok(Some((id, envelope)))
}

#[async_trait]
impl ReportQueue for RedisQueue {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let mut conn = self.manager.channel().await?;
        self.ensure_group(&mut conn).await?;

        let headers = serde_json::to_string(&envelope.headers)
            .map_err(|e| QueueError::Other(format!("encode headers: {e}")))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.queue_name)
            .arg("*")
            .arg("body")
            .arg(envelope.body.as_slice())
            .arg("headers")
            .arg(headers);
        if let Some(kind) = &envelope.kind {
            cmd.arg("kind").arg(kind);
        }
        if let Some(content_type) = &envelope.content_type {
            cmd.arg("content-type").arg(content_type);
        }

        // The returned entry id is the broker confirmation.
        let confirmed: Result<String, redis::RedisError> = cmd.query_async(&mut conn).await;
        match confirmed {
            Ok(_id) => Ok(()),
            Err(e) => {
                self.manager.invalidate().await;
                Err(map_redis_error("publish", e))
            }
        }
    }

    async fn consume(&self) -> Result<Delivery, QueueError> {
        let permit = self
            .prefetch
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::Closed)?;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }

            let mut conn = self.manager.channel().await?;
            self.ensure_group(&mut conn).await?;

            match self.read_one(&mut conn).await {
                Ok(Some((id, envelope))) => {
                    let tag = DeliveryTag(id);
                    self.unacked
                        .lock()
                        .map_err(|_| QueueError::Other("queue lock poisoned".into()))?
                        .insert(tag.clone(), permit);
                    return Ok(Delivery { tag, envelope });
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    self.manager.invalidate().await;
                    if e.is_transient() {
                        warn!(error = %e, "broker read failed; reconnecting on next poll");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        // Free the prefetch slot regardless of the XACK outcome; a failed ack
        // leaves the entry pending on the broker for redelivery.
        self.unacked
            .lock()
            .map_err(|_| QueueError::Other("queue lock poisoned".into()))?
            .remove(tag);

        let mut conn = self.manager.channel().await?;
        let acked: Result<u64, redis::RedisError> = redis::cmd("XACK")
            .arg(&self.queue_name)
            .arg(CONSUMER_GROUP)
            .arg(&tag.0)
            .query_async(&mut conn)
            .await;
        match acked {
            Ok(_) => Ok(()),
            Err(e) => {
                self.manager.invalidate().await;
                Err(map_redis_error("ack", e))
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.prefetch.close();
        self.manager.invalidate().await;
    }
}
