//! The `DailyReport` payload: the wire/document contract of the pipeline.
//!
//! The same shape is serialized onto the queue by the publisher, validated by
//! the consumer on every delivery, and persisted by the report store. Wire
//! field names are camelCase and must not drift; consumers in other services
//! match on them.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use salesfeed_core::{DomainError, DomainResult, ReportId};

/// Discriminator tag carried in the `type` field.
///
/// A single-variant enum (rather than a free string) so that deserializing a
/// message with any other tag fails at the serde layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    #[serde(rename = "daily_sales_report")]
    DailySalesReport,
}

/// One civil-time calendar day in `tz`, expressed as UTC instants.
///
/// `from`/`to` are the first and last instant of the day; both bounds are
/// inclusive. `tz` is recorded so downstream consumers can localize the
/// window correctly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub tz: Tz,
}

/// Per-SKU aggregate. Quantity only: per-SKU amounts are intentionally
/// dropped from the output schema (the total is aggregate-only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportItem {
    pub sku: String,
    #[serde(rename = "totalQuantity")]
    pub total_quantity: u64,
}

/// Canonical daily sales report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    #[serde(rename = "type")]
    pub kind: ReportKind,
    #[serde(rename = "dateRange")]
    pub date_range: DateRange,
    #[serde(rename = "totalSalesAmount")]
    pub total_sales_amount: f64,
    pub items: Vec<ReportItem>,
}

impl DailyReport {
    /// Decode and validate a message body.
    ///
    /// Any failure here (including an empty body) means the message can never
    /// be processed and is classified as poison by the consumer.
    pub fn from_json(body: &[u8]) -> DomainResult<Self> {
        let report: DailyReport = serde_json::from_slice(body)
            .map_err(|e| DomainError::validation(format!("malformed daily report: {e}")))?;
        report.validate()?;
        Ok(report)
    }

    /// Structural invariants beyond what serde enforces.
    pub fn validate(&self) -> DomainResult<()> {
        if self.date_range.from >= self.date_range.to {
            return Err(DomainError::invariant(format!(
                "dateRange.from ({}) must precede dateRange.to ({})",
                self.date_range.from, self.date_range.to
            )));
        }
        if self.total_sales_amount < 0.0 || !self.total_sales_amount.is_finite() {
            return Err(DomainError::validation(format!(
                "totalSalesAmount must be a non-negative number, got {}",
                self.total_sales_amount
            )));
        }
        let mut seen = std::collections::HashSet::with_capacity(self.items.len());
        for item in &self.items {
            if item.sku.is_empty() {
                return Err(DomainError::validation("item sku must be non-empty"));
            }
            if !seen.insert(item.sku.as_str()) {
                return Err(DomainError::invariant(format!(
                    "duplicate sku in items: {}",
                    item.sku
                )));
            }
        }
        Ok(())
    }
}

/// Persisted form of a report.
///
/// Uniquely keyed by `report.date_range.from`; repeated saves for the same
/// day replace the content but keep `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub id: ReportId,
    #[serde(flatten)]
    pub report: DailyReport,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}
