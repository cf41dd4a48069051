//! Producer side: compute a day's report and publish it, confirmed.

use thiserror::Error;
use tracing::{info, instrument};

use salesfeed_broker::{MessageEnvelope, QueueError, ReportQueue};
use salesfeed_reports::{ComputeOpts, DailyReport, SourceError, TransactionSource, compute_daily_report};

/// Message-type attribute stamped on every published report.
pub const MESSAGE_KIND: &str = "daily_sales_report";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("encode report: {0}")]
    Encode(String),
}

/// Publishes reports onto the queue with broker confirmation.
pub struct Publisher<Q> {
    queue: Q,
}

impl<Q: ReportQueue> Publisher<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    /// Serialize and publish one report. Returns only after the broker has
    /// confirmed receipt; any failure propagates to the caller.
    #[instrument(skip_all, fields(range_from = %report.date_range.from))]
    pub async fn publish(&self, report: &DailyReport) -> Result<(), PublishError> {
        let body = serde_json::to_vec(report).map_err(|e| PublishError::Encode(e.to_string()))?;
        let envelope = MessageEnvelope::new(body)
            .with_kind(MESSAGE_KIND)
            .with_content_type("application/json");
        self.queue.publish(envelope).await?;
        info!(
            total = report.total_sales_amount,
            items = report.items.len(),
            "published daily sales report"
        );
        Ok(())
    }
}

/// One full producer run: aggregate the target day, then publish.
///
/// Shared by the scheduler and the on-demand path so both behave identically.
pub async fn publish_daily_report<Q: ReportQueue>(
    source: &dyn TransactionSource,
    publisher: &Publisher<Q>,
    opts: &ComputeOpts,
) -> Result<DailyReport, PublishError> {
    let report = compute_daily_report(source, opts).await?;
    publisher.publish(&report).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, Utc};
    use salesfeed_broker::InMemoryQueue;
    use salesfeed_reports::LineItem;

    struct FixedSource(Vec<LineItem>);

    #[async_trait]
    impl TransactionSource for FixedSource {
        async fn line_items_between(
            &self,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<LineItem>, SourceError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn published_message_round_trips() {
        let queue = Arc::new(InMemoryQueue::new(5));
        let publisher = Publisher::new(queue.clone());
        let source = FixedSource(vec![LineItem {
            sku: "A".into(),
            quantity: 2,
            unit_price: 10.0,
        }]);
        let opts = ComputeOpts {
            date: Some(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()),
            tz: Some(chrono_tz::UTC),
        };

        let report = publish_daily_report(&source, &publisher, &opts).await.unwrap();

        let delivery = queue.consume().await.unwrap();
        assert_eq!(delivery.envelope.kind.as_deref(), Some(MESSAGE_KIND));
        assert_eq!(delivery.envelope.retry_attempt(), 0);
        assert!(delivery.envelope.persistent);
        let decoded = DailyReport::from_json(&delivery.envelope.body).unwrap();
        assert_eq!(decoded, report);
        assert_eq!(decoded.total_sales_amount, 20.0);
    }

    #[tokio::test]
    async fn source_failure_publishes_nothing() {
        struct FailingSource;

        #[async_trait]
        impl TransactionSource for FailingSource {
            async fn line_items_between(
                &self,
                _from: DateTime<Utc>,
                _to: DateTime<Utc>,
            ) -> Result<Vec<LineItem>, SourceError> {
                Err(SourceError("db down".into()))
            }
        }

        let queue = Arc::new(InMemoryQueue::new(5));
        let publisher = Publisher::new(queue.clone());
        let result =
            publish_daily_report(&FailingSource, &publisher, &ComputeOpts::default()).await;

        assert!(matches!(result, Err(PublishError::Source(_))));
        assert_eq!(queue.ready_len(), 0);
    }
}
