//! `salesfeed-reports` — daily report domain: aggregation and persistence.
//!
//! The aggregation engine turns raw transaction line items into the canonical
//! `DailyReport` payload; the report store converts at-least-once delivery
//! into effectively-once storage via an idempotent upsert keyed by the
//! report's range start.

pub mod engine;
pub mod model;
pub mod store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use engine::{ComputeOpts, LineItem, SourceError, TransactionSource, compute_daily_report, day_range_utc};
pub use model::{DailyReport, DateRange, ReportItem, ReportKind, StoredReport};
pub use store::{InMemoryReportStore, Page, ReportFilter, ReportPage, ReportStore, StoreError};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresReportStore, PostgresTransactionSource};
