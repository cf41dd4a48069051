//! Consumer side: the retry state machine.
//!
//! Every delivery is acknowledged exactly once, whatever the outcome:
//!
//! - parse/validation failure → ack, drop (poison);
//! - transient store failure → ack, wait the backoff delay, publish a fresh
//!   message with the attempt counter incremented;
//! - any other failure → ack, drop;
//! - success → ack, then notify fire-and-forget.
//!
//! The store save happens *before* the ack, so a crash between the two can
//! only cause redelivery of an already-persisted report, which the store's
//! idempotent upsert absorbs. The backoff wait is a plain timer on the
//! requeue path; on shutdown it is cut short and the requeue message is
//! flushed immediately so an acked delivery is never lost.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use salesfeed_broker::{Delivery, QueueError, ReportQueue};
use salesfeed_reports::{DailyReport, ReportStore};

use crate::classify::{FailureClass, ProcessError, classify};
use crate::notify::Notifier;
use crate::retry::RetryPolicy;

/// What the handler did with one delivery. Exposed for tests and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Persisted and acknowledged; notification spawned.
    Delivered,
    Dropped(DropReason),
    /// Acknowledged and republished with the incremented attempt counter.
    Requeued { next_attempt: u32, delay: Duration },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DropReason {
    Poison,
    Permanent,
    /// The configured retry bound was exceeded.
    Exhausted,
}

/// Long-running queue consumer. Deliveries are handled concurrently, bounded
/// by the queue's prefetch window.
pub struct Consumer<Q: ?Sized, S: ?Sized, N: ?Sized> {
    queue: Arc<Q>,
    store: Arc<S>,
    notifier: Arc<N>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl<Q, S, N> Consumer<Q, S, N>
where
    Q: ReportQueue + ?Sized + 'static,
    S: ReportStore + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    pub fn new(
        queue: Arc<Q>,
        store: Arc<S>,
        notifier: Arc<N>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            store,
            notifier,
            policy,
            shutdown,
        }
    }

    /// Consume until shutdown. Each delivery runs in its own task; the
    /// prefetch window caps how many are in flight.
    pub async fn run(self: Arc<Self>) {
        info!("consumer started");
        let handlers = TaskTracker::new();
        loop {
            let delivery = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                delivery = self.queue.consume() => delivery,
            };

            match delivery {
                Ok(delivery) => {
                    let consumer = Arc::clone(&self);
                    handlers.spawn(async move {
                        if let Err(e) = consumer.handle_delivery(delivery).await {
                            error!(error = %e, "delivery handling failed at the transport");
                        }
                    });
                }
                Err(QueueError::Closed) => break,
                Err(e) => {
                    error!(error = %e, "consume failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        // An in-flight handler may still need to flush a requeue message
        // (its backoff wait ends early on shutdown); the queue must stay
        // open until every handler has finished.
        handlers.close();
        handlers.wait().await;
        self.queue.close().await;
        info!("consumer stopped");
    }

    /// Drive one delivery through the state machine.
    ///
    /// Only transport (queue) errors propagate; processing failures are
    /// resolved into an outcome here.
    #[instrument(skip_all, fields(tag = %delivery.tag, attempt = delivery.envelope.retry_attempt()))]
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<HandlerOutcome, QueueError> {
        let attempt = delivery.envelope.retry_attempt();

        let error = match self.process(&delivery.envelope.body).await {
            Ok(report) => {
                self.queue.ack(&delivery.tag).await?;
                info!(range_from = %report.date_range.from, "report stored");
                self.spawn_notification(report);
                return Ok(HandlerOutcome::Delivered);
            }
            Err(error) => error,
        };

        match classify(&error) {
            FailureClass::Poison => {
                error!(error = %error, "poison message; dropping");
                self.queue.ack(&delivery.tag).await?;
                Ok(HandlerOutcome::Dropped(DropReason::Poison))
            }
            FailureClass::Permanent => {
                error!(error = %error, "unrecoverable failure; dropping");
                self.queue.ack(&delivery.tag).await?;
                Ok(HandlerOutcome::Dropped(DropReason::Permanent))
            }
            FailureClass::Transient => {
                let next_attempt = attempt + 1;
                if self.policy.is_exhausted(next_attempt) {
                    error!(error = %error, attempt, "retries exhausted; dropping");
                    self.queue.ack(&delivery.tag).await?;
                    return Ok(HandlerOutcome::Dropped(DropReason::Exhausted));
                }

                let delay = self.policy.delay_for_attempt(attempt);
                warn!(
                    error = %error,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure; requeueing after backoff"
                );
                // Ack first so the broker does not redeliver while we wait;
                // from here on the requeue message is the only copy.
                self.queue.ack(&delivery.tag).await?;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    // Shutting down: flush the requeue now rather than lose
                    // the acked message.
                    _ = self.shutdown.cancelled() => {
                        debug!("shutdown during backoff; flushing requeue early");
                    }
                }
                self.queue.publish(delivery.envelope.next_attempt()).await?;
                Ok(HandlerOutcome::Requeued { next_attempt, delay })
            }
        }
    }

    async fn process(&self, body: &[u8]) -> Result<DailyReport, ProcessError> {
        let report = DailyReport::from_json(body)?;
        self.store.save(&report).await?;
        Ok(report)
    }

    fn spawn_notification(&self, report: DailyReport) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.send(&report).await {
                // Fire-and-forget: never feeds back into the retry machine.
                error!(error = %e, "report notification failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use salesfeed_broker::{InMemoryQueue, MessageEnvelope, RETRY_ATTEMPT_HEADER};
    use salesfeed_reports::{
        DateRange, InMemoryReportStore, ReportItem, ReportKind, StoreError, StoredReport,
    };
    use salesfeed_reports::{Page, ReportFilter, ReportPage};

    use crate::notify::RecordingNotifier;
    use crate::retry::DEFAULT_BACKOFF;

    fn sample_report() -> DailyReport {
        DailyReport {
            kind: ReportKind::DailySalesReport,
            date_range: DateRange {
                from: Utc.with_ymd_and_hms(2025, 1, 14, 23, 0, 0).unwrap(),
                to: Utc.with_ymd_and_hms(2025, 1, 15, 22, 59, 59).unwrap(),
                tz: chrono_tz::Europe::Berlin,
            },
            total_sales_amount: 30.0,
            items: vec![ReportItem {
                sku: "A".into(),
                total_quantity: 3,
            }],
        }
    }

    fn envelope_for(report: &DailyReport) -> MessageEnvelope {
        MessageEnvelope::new(serde_json::to_vec(report).unwrap())
    }

    /// Store that fails with the given error for the first `failures` saves.
    struct FlakyStore {
        inner: InMemoryReportStore,
        remaining: AtomicU32,
        error: StoreError,
    }

    impl FlakyStore {
        fn new(failures: u32, error: StoreError) -> Self {
            Self {
                inner: InMemoryReportStore::new(),
                remaining: AtomicU32::new(failures),
                error,
            }
        }
    }

    #[async_trait]
    impl ReportStore for FlakyStore {
        async fn save(&self, report: &DailyReport) -> Result<StoredReport, StoreError> {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(self.error.clone());
            }
            self.inner.save(report).await
        }

        async fn get(
            &self,
            id: salesfeed_core::ReportId,
        ) -> Result<Option<StoredReport>, StoreError> {
            self.inner.get(id).await
        }

        async fn list(
            &self,
            filter: &ReportFilter,
            page: Page,
        ) -> Result<ReportPage, StoreError> {
            self.inner.list(filter, page).await
        }
    }

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        store: Arc<FlakyStore>,
        notifier: Arc<RecordingNotifier>,
        consumer: Consumer<InMemoryQueue, FlakyStore, RecordingNotifier>,
    }

    fn fixture(store: FlakyStore, policy: RetryPolicy) -> Fixture {
        let queue = Arc::new(InMemoryQueue::new(5));
        let store = Arc::new(store);
        let notifier = Arc::new(RecordingNotifier::new());
        let consumer = Consumer::new(
            queue.clone(),
            store.clone(),
            notifier.clone(),
            policy,
            CancellationToken::new(),
        );
        Fixture {
            queue,
            store,
            notifier,
            consumer,
        }
    }

    async fn drain_spawned_tasks() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn valid_report_is_stored_acked_and_notified() {
        let f = fixture(
            FlakyStore::new(0, StoreError::Timeout("unused".into())),
            RetryPolicy::default(),
        );
        let report = sample_report();
        f.queue.publish(envelope_for(&report)).await.unwrap();

        let delivery = f.queue.consume().await.unwrap();
        let outcome = f.consumer.handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Delivered);
        assert_eq!(f.queue.unacked_len(), 0);
        assert_eq!(f.store.inner.len(), 1);

        drain_spawned_tasks().await;
        assert_eq!(f.notifier.sent(), vec![report]);
    }

    #[tokio::test]
    async fn poison_message_is_acked_and_dropped() {
        let f = fixture(
            FlakyStore::new(0, StoreError::Timeout("unused".into())),
            RetryPolicy::default(),
        );
        f.queue
            .publish(MessageEnvelope::new(Vec::new()))
            .await
            .unwrap();

        let delivery = f.queue.consume().await.unwrap();
        let outcome = f.consumer.handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Dropped(DropReason::Poison));
        assert_eq!(f.queue.ready_len(), 0);
        assert_eq!(f.queue.unacked_len(), 0);
        assert!(f.store.inner.is_empty());
        drain_spawned_tasks().await;
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_transient_failure_requeues_after_one_second() {
        let f = fixture(
            FlakyStore::new(u32::MAX, StoreError::Timeout("pool timed out".into())),
            RetryPolicy::default(),
        );
        f.queue.publish(envelope_for(&sample_report())).await.unwrap();

        let delivery = f.queue.consume().await.unwrap();
        let started = tokio::time::Instant::now();
        let outcome = f.consumer.handle_delivery(delivery).await.unwrap();

        assert_eq!(
            outcome,
            HandlerOutcome::Requeued {
                next_attempt: 1,
                delay: Duration::from_secs(1),
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(1));

        let retry = f.queue.consume().await.unwrap();
        assert_eq!(retry.envelope.retry_attempt(), 1);
        drain_spawned_tasks().await;
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn high_attempt_waits_the_ceiling_delay() {
        let f = fixture(
            FlakyStore::new(u32::MAX, StoreError::ConnectionReset("reset by peer".into())),
            RetryPolicy::default(),
        );
        f.queue
            .publish(envelope_for(&sample_report()).next_attempt().next_attempt().next_attempt())
            .await
            .unwrap();

        let delivery = f.queue.consume().await.unwrap();
        assert_eq!(delivery.envelope.retry_attempt(), 3);

        let started = tokio::time::Instant::now();
        let outcome = f.consumer.handle_delivery(delivery).await.unwrap();

        assert_eq!(
            outcome,
            HandlerOutcome::Requeued {
                next_attempt: 4,
                delay: Duration::from_secs(30),
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(30));
        let retry = f.queue.consume().await.unwrap();
        assert_eq!(retry.envelope.retry_attempt(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_beyond_the_table_stay_at_the_ceiling() {
        let f = fixture(
            FlakyStore::new(u32::MAX, StoreError::Unreachable("refused".into())),
            RetryPolicy::default(),
        );
        let mut envelope = envelope_for(&sample_report());
        envelope = envelope.with_header(RETRY_ATTEMPT_HEADER, 1_000);
        f.queue.publish(envelope).await.unwrap();

        let delivery = f.queue.consume().await.unwrap();
        let outcome = f.consumer.handle_delivery(delivery).await.unwrap();

        assert_eq!(
            outcome,
            HandlerOutcome::Requeued {
                next_attempt: 1_001,
                delay: Duration::from_secs(30),
            }
        );
    }

    #[tokio::test]
    async fn bounded_policy_drops_when_exhausted() {
        let f = fixture(
            FlakyStore::new(u32::MAX, StoreError::Timeout("pool timed out".into())),
            RetryPolicy::new(DEFAULT_BACKOFF.to_vec(), Some(2)).unwrap(),
        );
        f.queue
            .publish(envelope_for(&sample_report()).with_header(RETRY_ATTEMPT_HEADER, 2))
            .await
            .unwrap();

        let delivery = f.queue.consume().await.unwrap();
        let outcome = f.consumer.handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Dropped(DropReason::Exhausted));
        assert_eq!(f.queue.ready_len(), 0);
        assert_eq!(f.queue.unacked_len(), 0);
    }

    #[tokio::test]
    async fn unclassified_store_failure_is_dropped_not_retried() {
        let f = fixture(
            FlakyStore::new(u32::MAX, StoreError::Storage("unique violation".into())),
            RetryPolicy::default(),
        );
        f.queue.publish(envelope_for(&sample_report())).await.unwrap();

        let delivery = f.queue.consume().await.unwrap();
        let outcome = f.consumer.handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Dropped(DropReason::Permanent));
        assert_eq!(f.queue.ready_len(), 0);
        drain_spawned_tasks().await;
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_flushes_the_requeue() {
        let queue = Arc::new(InMemoryQueue::new(5));
        let store = Arc::new(FlakyStore::new(
            u32::MAX,
            StoreError::Timeout("pool timed out".into()),
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(
            queue.clone(),
            store,
            notifier,
            RetryPolicy::default(),
            shutdown.clone(),
        );

        // High attempt counter: the backoff would be 30s.
        queue
            .publish(envelope_for(&sample_report()).with_header(RETRY_ATTEMPT_HEADER, 5))
            .await
            .unwrap();
        let delivery = queue.consume().await.unwrap();

        let handler = tokio::spawn(async move { consumer.handle_delivery(delivery).await });
        tokio::task::yield_now().await;
        shutdown.cancel();

        let outcome = handler.await.unwrap().unwrap();
        assert!(matches!(outcome, HandlerOutcome::Requeued { next_attempt: 6, .. }));
        // The requeue message made it out despite the cancelled wait.
        assert_eq!(queue.ready_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_keeps_queue_open_until_backoff_requeue_is_flushed() {
        let queue = Arc::new(InMemoryQueue::new(5));
        let store = Arc::new(FlakyStore::new(
            u32::MAX,
            StoreError::Timeout("pool timed out".into()),
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let shutdown = CancellationToken::new();
        let consumer = Arc::new(Consumer::new(
            queue.clone(),
            store,
            notifier,
            RetryPolicy::default(),
            shutdown.clone(),
        ));

        queue
            .publish(envelope_for(&sample_report()).with_header(RETRY_ATTEMPT_HEADER, 5))
            .await
            .unwrap();
        let running = tokio::spawn(consumer.run());

        // Wait until the delivery has been acked and the handler sits in its
        // backoff wait (time is paused, so the wait cannot elapse on its own).
        for _ in 0..64 {
            if queue.ready_len() == 0 && queue.unacked_len() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.ready_len(), 0);
        assert_eq!(queue.unacked_len(), 0);

        shutdown.cancel();
        running.await.unwrap();

        // The acked message was republished before the loop closed the queue.
        assert_eq!(queue.ready_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_delivers_on_retry() {
        let f = fixture(
            FlakyStore::new(1, StoreError::Timeout("pool timed out".into())),
            RetryPolicy::default(),
        );
        let report = sample_report();
        f.queue.publish(envelope_for(&report)).await.unwrap();

        let first = f.queue.consume().await.unwrap();
        let outcome = f.consumer.handle_delivery(first).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Requeued { next_attempt: 1, .. }));

        let second = f.queue.consume().await.unwrap();
        let outcome = f.consumer.handle_delivery(second).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Delivered);
        assert_eq!(f.store.inner.len(), 1);
        drain_spawned_tasks().await;
        assert_eq!(f.notifier.sent(), vec![report]);
    }
}
