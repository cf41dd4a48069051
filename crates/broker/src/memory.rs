//! In-memory queue for tests and single-process deployments.
//!
//! Implements the full transport contract: FIFO delivery, a bounded prefetch
//! window enforced with a semaphore, and an unacked ledger so a delivery
//! occupies its slot until acknowledged.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::envelope::MessageEnvelope;
use crate::queue::{Delivery, DeliveryTag, QueueError, ReportQueue};

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<MessageEnvelope>,
    unacked: HashMap<DeliveryTag, OwnedSemaphorePermit>,
}

/// In-memory durable-in-process queue.
#[derive(Debug)]
pub struct InMemoryQueue {
    prefetch: Arc<Semaphore>,
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
    next_tag: AtomicU64,
}

impl InMemoryQueue {
    /// Create a queue with the given prefetch window (clamped to ≥ 1).
    pub fn new(prefetch: usize) -> Self {
        Self {
            prefetch: Arc::new(Semaphore::new(prefetch.max(1))),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            next_tag: AtomicU64::new(1),
        }
    }

    /// Messages waiting for delivery (test/diagnostic helper).
    pub fn ready_len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").ready.len()
    }

    /// Delivered but not yet acknowledged messages (test/diagnostic helper).
    pub fn unacked_len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").unacked.len()
    }
}

#[async_trait]
impl ReportQueue for InMemoryQueue {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.state
            .lock()
            .map_err(|_| QueueError::Other("queue lock poisoned".into()))?
            .ready
            .push_back(envelope);
        // The enqueue above is the broker-side confirmation.
        self.notify.notify_one();
        Ok(())
    }

    async fn consume(&self) -> Result<Delivery, QueueError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }

            let has_ready = {
                let state = self
                    .state
                    .lock()
                    .map_err(|_| QueueError::Other("queue lock poisoned".into()))?;
                !state.ready.is_empty()
            };

            if !has_ready {
                // Register before re-checking so a concurrent close() or
                // publish() cannot slip between the check and the wait.
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.closed.load(Ordering::SeqCst) {
                    return Err(QueueError::Closed);
                }
                let raced = {
                    let state = self
                        .state
                        .lock()
                        .map_err(|_| QueueError::Other("queue lock poisoned".into()))?;
                    !state.ready.is_empty()
                };
                if !raced {
                    notified.await;
                }
                continue;
            }

            // Take a prefetch slot before taking the message; the slot is
            // held (via the unacked ledger) until ack.
            let permit = self
                .prefetch
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| QueueError::Closed)?;

            let mut state = self
                .state
                .lock()
                .map_err(|_| QueueError::Other("queue lock poisoned".into()))?;
            match state.ready.pop_front() {
                Some(envelope) => {
                    let tag =
                        DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst).to_string());
                    state.unacked.insert(tag.clone(), permit);
                    return Ok(Delivery { tag, envelope });
                }
                // Another consumer won the race; the permit drops here.
                None => continue,
            }
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let removed = self
            .state
            .lock()
            .map_err(|_| QueueError::Other("queue lock poisoned".into()))?
            .unacked
            .remove(tag);
        match removed {
            // Dropping the permit frees the prefetch slot.
            Some(_permit) => Ok(()),
            None => Err(QueueError::Other(format!("unknown delivery tag {tag}"))),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.prefetch.close();
        self.notify.notify_waiters();
    }
}
