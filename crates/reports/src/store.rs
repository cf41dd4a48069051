//! Report persistence.
//!
//! The store is the idempotency boundary of the pipeline: saves are keyed by
//! `dateRange.from`, so redelivered messages overwrite instead of duplicate.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use salesfeed_core::ReportId;

use crate::model::{DailyReport, StoredReport};

/// Store failure, classified structurally.
///
/// The consumer's retry machine branches on [`StoreError::is_transient`];
/// adding a variant here decides its retry behavior, no string matching
/// anywhere.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store operation timed out: {0}")]
    Timeout(String),

    #[error("store connection reset: {0}")]
    ConnectionReset(String),

    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Whether a retry with backoff can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::ConnectionReset(_) | StoreError::Unreachable(_)
        )
    }
}

/// Filter over the report list (bounds apply to `dateRange.from`, inclusive).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Pagination request (1-based page).
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

/// One page of stored reports, newest range first.
#[derive(Debug, Clone)]
pub struct ReportPage {
    pub page: u32,
    pub limit: usize,
    pub total: usize,
    pub items: Vec<StoredReport>,
}

/// Report store abstraction.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Idempotent upsert keyed by `report.date_range.from`.
    ///
    /// A second save with the same range start replaces the content and keeps
    /// the original `id` and `created_at`.
    async fn save(&self, report: &DailyReport) -> Result<StoredReport, StoreError>;

    /// Look up a report by its identifier.
    async fn get(&self, id: ReportId) -> Result<Option<StoredReport>, StoreError>;

    /// List stored reports matching `filter`, newest range first.
    async fn list(&self, filter: &ReportFilter, page: Page) -> Result<ReportPage, StoreError>;
}

#[async_trait]
impl<S> ReportStore for std::sync::Arc<S>
where
    S: ReportStore + ?Sized,
{
    async fn save(&self, report: &DailyReport) -> Result<StoredReport, StoreError> {
        (**self).save(report).await
    }

    async fn get(&self, id: ReportId) -> Result<Option<StoredReport>, StoreError> {
        (**self).get(id).await
    }

    async fn list(&self, filter: &ReportFilter, page: Page) -> Result<ReportPage, StoreError> {
        (**self).list(filter, page).await
    }
}

/// In-memory report store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReportStore {
    by_range_start: RwLock<HashMap<DateTime<Utc>, StoredReport>>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_range_start.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn save(&self, report: &DailyReport) -> Result<StoredReport, StoreError> {
        let mut map = self
            .by_range_start
            .write()
            .map_err(|_| StoreError::Storage("store lock poisoned".into()))?;

        let stored = match map.get(&report.date_range.from) {
            Some(existing) => StoredReport {
                id: existing.id,
                report: report.clone(),
                created_at: existing.created_at,
            },
            None => StoredReport {
                id: ReportId::new(),
                report: report.clone(),
                created_at: Utc::now(),
            },
        };
        map.insert(report.date_range.from, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: ReportId) -> Result<Option<StoredReport>, StoreError> {
        let map = self
            .by_range_start
            .read()
            .map_err(|_| StoreError::Storage("store lock poisoned".into()))?;
        Ok(map.values().find(|r| r.id == id).cloned())
    }

    async fn list(&self, filter: &ReportFilter, page: Page) -> Result<ReportPage, StoreError> {
        let map = self
            .by_range_start
            .read()
            .map_err(|_| StoreError::Storage("store lock poisoned".into()))?;

        let mut matched: Vec<StoredReport> = map
            .values()
            .filter(|r| {
                let from = r.report.date_range.from;
                filter.from.is_none_or(|lo| from >= lo) && filter.to.is_none_or(|hi| from <= hi)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.report.date_range.from.cmp(&a.report.date_range.from));

        let total = matched.len();
        let limit = page.limit.max(1);
        let start = (page.page.max(1) as usize - 1).saturating_mul(limit);
        let items = matched.into_iter().skip(start).take(limit).collect();

        Ok(ReportPage {
            page: page.page.max(1),
            limit,
            total,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateRange, ReportItem, ReportKind};
    use chrono::TimeZone;

    fn report_for(day: u32, total: f64) -> DailyReport {
        DailyReport {
            kind: ReportKind::DailySalesReport,
            date_range: DateRange {
                from: Utc.with_ymd_and_hms(2025, 1, day, 23, 0, 0).unwrap(),
                to: Utc.with_ymd_and_hms(2025, 1, day + 1, 22, 59, 59).unwrap(),
                tz: chrono_tz::Europe::Berlin,
            },
            total_sales_amount: total,
            items: vec![ReportItem {
                sku: "A".into(),
                total_quantity: 1,
            }],
        }
    }

    #[tokio::test]
    async fn save_is_idempotent_per_range_start() {
        let store = InMemoryReportStore::new();

        let first = store.save(&report_for(10, 30.0)).await.unwrap();
        let second = store.save(&report_for(10, 45.5)).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        // Second call's content wins.
        assert_eq!(second.report.total_sales_amount, 45.5);
        let fetched = store.get(first.id).await.unwrap().unwrap();
        assert_eq!(fetched.report.total_sales_amount, 45.5);
    }

    #[tokio::test]
    async fn distinct_days_are_distinct_records() {
        let store = InMemoryReportStore::new();
        store.save(&report_for(10, 1.0)).await.unwrap();
        store.save(&report_for(11, 2.0)).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paged() {
        let store = InMemoryReportStore::new();
        for day in 10..15 {
            store.save(&report_for(day, day as f64)).await.unwrap();
        }

        let page = store
            .list(&ReportFilter::default(), Page { page: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].report.date_range.from > page.items[1].report.date_range.from);

        let last = store
            .list(&ReportFilter::default(), Page { page: 3, limit: 2 })
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_on_range_start() {
        let store = InMemoryReportStore::new();
        for day in 10..15 {
            store.save(&report_for(day, 0.0)).await.unwrap();
        }

        let filter = ReportFilter {
            from: Some(Utc.with_ymd_and_hms(2025, 1, 12, 0, 0, 0).unwrap()),
            to: None,
        };
        let page = store.list(&filter, Page::default()).await.unwrap();
        assert_eq!(page.total, 3);
    }
}
