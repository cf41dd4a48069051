//! Report-delivery notification.
//!
//! Notification is fire-and-forget: the consumer spawns the send after the
//! delivery is acknowledged, and a failure here is logged but never feeds
//! back into the retry machine. The trait seam keeps the transport (SMTP,
//! webhook, ...) out of the pipeline.

use std::fmt::Write as _;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use salesfeed_reports::DailyReport;

#[derive(Debug, Clone, Error)]
#[error("notification send failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound notification channel for delivered reports.
///
/// Delivery is at-least-once upstream, so a redelivered report can be
/// notified more than once; implementations must tolerate that.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, report: &DailyReport) -> Result<(), NotifyError>;
}

#[async_trait]
impl<N> Notifier for std::sync::Arc<N>
where
    N: Notifier + ?Sized,
{
    async fn send(&self, report: &DailyReport) -> Result<(), NotifyError> {
        (**self).send(report).await
    }
}

/// Subject line for a report notification.
pub fn render_subject(report: &DailyReport) -> String {
    let day = report
        .date_range
        .from
        .with_timezone(&report.date_range.tz)
        .date_naive();
    format!("Daily sales report {day}")
}

/// Plain-text body: the total, then one line per SKU.
pub fn render_text(report: &DailyReport) -> String {
    let mut text = format!(
        "Total sales amount: {:.2}\n\nItems sold:\n",
        report.total_sales_amount
    );
    if report.items.is_empty() {
        text.push_str("(no items)\n");
    } else {
        for item in &report.items {
            let _ = writeln!(text, "- {}: {}", item.sku, item.total_quantity);
        }
    }
    text
}

/// Notifier that writes the rendered notification to the log. Stands in for
/// a real mail transport in dev and single-process deployments.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, report: &DailyReport) -> Result<(), NotifyError> {
        info!(
            subject = %render_subject(report),
            body = %render_text(report),
            "report notification"
        );
        Ok(())
    }
}

/// Test double that records every send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<DailyReport>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<DailyReport> {
        self.sent.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, report: &DailyReport) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError("notifier lock poisoned".into()))?
            .push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use salesfeed_reports::{DateRange, ReportItem, ReportKind};

    fn sample(items: Vec<ReportItem>) -> DailyReport {
        DailyReport {
            kind: ReportKind::DailySalesReport,
            date_range: DateRange {
                from: Utc.with_ymd_and_hms(2025, 3, 9, 23, 0, 0).unwrap(),
                to: Utc.with_ymd_and_hms(2025, 3, 10, 22, 59, 59).unwrap(),
                tz: chrono_tz::Europe::Berlin,
            },
            total_sales_amount: 30.0,
            items,
        }
    }

    #[test]
    fn subject_names_the_local_day() {
        // 2025-03-09T23:00Z is already March 10 in Berlin.
        let report = sample(vec![]);
        assert_eq!(render_subject(&report), "Daily sales report 2025-03-10");
    }

    #[test]
    fn body_lists_items() {
        let report = sample(vec![ReportItem {
            sku: "A".into(),
            total_quantity: 3,
        }]);
        let text = render_text(&report);
        assert!(text.contains("Total sales amount: 30.00"));
        assert!(text.contains("- A: 3"));
    }

    #[test]
    fn empty_report_says_so() {
        assert!(render_text(&sample(vec![])).contains("(no items)"));
    }
}
