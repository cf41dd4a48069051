//! Postgres-backed report store.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE daily_reports (
//!     id                 UUID PRIMARY KEY,
//!     range_from         TIMESTAMPTZ NOT NULL UNIQUE,
//!     range_to           TIMESTAMPTZ NOT NULL,
//!     tz                 TEXT NOT NULL,
//!     total_sales_amount DOUBLE PRECISION NOT NULL,
//!     items              JSONB NOT NULL,
//!     created_at         TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! The UNIQUE constraint on `range_from` is what makes `save` an idempotent
//! upsert: `ON CONFLICT (range_from) DO UPDATE` replaces the content while
//! `id` and `created_at` are left untouched.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::instrument;
use uuid::Uuid;

use salesfeed_core::ReportId;

use crate::engine::{LineItem, SourceError, TransactionSource};
use crate::model::{DailyReport, DateRange, ReportItem, ReportKind, StoredReport};
use crate::store::{Page, ReportFilter, ReportPage, ReportStore, StoreError};

/// Postgres-backed report store.
///
/// Shares a SQLx pool; cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresReportStore {
    pool: Arc<PgPool>,
}

impl PostgresReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(op: &str, e: sqlx::Error) -> StoreError {
    use std::io::ErrorKind;

    match e {
        sqlx::Error::PoolTimedOut => StoreError::Timeout(format!("{op}: pool timed out")),
        sqlx::Error::Io(io) => match io.kind() {
            ErrorKind::TimedOut => StoreError::Timeout(format!("{op}: {io}")),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                StoreError::ConnectionReset(format!("{op}: {io}"))
            }
            ErrorKind::ConnectionRefused | ErrorKind::NotConnected => {
                StoreError::Unreachable(format!("{op}: {io}"))
            }
            _ => StoreError::Storage(format!("{op}: {io}")),
        },
        sqlx::Error::PoolClosed => StoreError::Unreachable(format!("{op}: pool closed")),
        other => StoreError::Storage(format!("{op}: {other}")),
    }
}

fn row_to_stored(row: &PgRow) -> Result<StoredReport, StoreError> {
    let id: Uuid = row
        .try_get("id")
        .map_err(|e| StoreError::Storage(format!("read id: {e}")))?;
    let range_from: DateTime<Utc> = row
        .try_get("range_from")
        .map_err(|e| StoreError::Storage(format!("read range_from: {e}")))?;
    let range_to: DateTime<Utc> = row
        .try_get("range_to")
        .map_err(|e| StoreError::Storage(format!("read range_to: {e}")))?;
    let tz_name: String = row
        .try_get("tz")
        .map_err(|e| StoreError::Storage(format!("read tz: {e}")))?;
    let tz = Tz::from_str(&tz_name)
        .map_err(|e| StoreError::Storage(format!("invalid tz {tz_name:?}: {e}")))?;
    let total_sales_amount: f64 = row
        .try_get("total_sales_amount")
        .map_err(|e| StoreError::Storage(format!("read total: {e}")))?;
    let items_json: serde_json::Value = row
        .try_get("items")
        .map_err(|e| StoreError::Storage(format!("read items: {e}")))?;
    let items: Vec<ReportItem> = serde_json::from_value(items_json)
        .map_err(|e| StoreError::Storage(format!("decode items: {e}")))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| StoreError::Storage(format!("read created_at: {e}")))?;

    Ok(StoredReport {
        id: ReportId::from_uuid(id),
        report: DailyReport {
            kind: ReportKind::DailySalesReport,
            date_range: DateRange {
                from: range_from,
                to: range_to,
                tz,
            },
            total_sales_amount,
            items,
        },
        created_at,
    })
}

/// Line-item query over the invoicing schema.
///
/// Expected schema:
///
/// ```sql
/// CREATE TABLE invoice_lines (
///     sku        TEXT NOT NULL,
///     quantity   BIGINT NOT NULL,
///     unit_price DOUBLE PRECISION NOT NULL,
///     sold_at    TIMESTAMPTZ NOT NULL
/// );
/// ```
#[derive(Debug, Clone)]
pub struct PostgresTransactionSource {
    pool: Arc<PgPool>,
}

impl PostgresTransactionSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl TransactionSource for PostgresTransactionSource {
    #[instrument(skip(self), err)]
    async fn line_items_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LineItem>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT sku, quantity, unit_price
            FROM invoice_lines
            WHERE sold_at BETWEEN $1 AND $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| SourceError(format!("query line items: {e}")))?;

        rows.iter()
            .map(|row| {
                let sku: String = row
                    .try_get("sku")
                    .map_err(|e| SourceError(format!("read sku: {e}")))?;
                let quantity: i64 = row
                    .try_get("quantity")
                    .map_err(|e| SourceError(format!("read quantity: {e}")))?;
                let unit_price: f64 = row
                    .try_get("unit_price")
                    .map_err(|e| SourceError(format!("read unit_price: {e}")))?;
                Ok(LineItem {
                    sku,
                    quantity: quantity.max(0) as u64,
                    unit_price,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ReportStore for PostgresReportStore {
    #[instrument(skip(self, report), fields(range_from = %report.date_range.from), err)]
    async fn save(&self, report: &DailyReport) -> Result<StoredReport, StoreError> {
        let items = serde_json::to_value(&report.items)
            .map_err(|e| StoreError::Storage(format!("encode items: {e}")))?;

        let row = sqlx::query(
            r#"
            INSERT INTO daily_reports (id, range_from, range_to, tz, total_sales_amount, items)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (range_from) DO UPDATE SET
                range_to = EXCLUDED.range_to,
                tz = EXCLUDED.tz,
                total_sales_amount = EXCLUDED.total_sales_amount,
                items = EXCLUDED.items
            RETURNING id, range_from, range_to, tz, total_sales_amount, items, created_at
            "#,
        )
        .bind(*ReportId::new().as_uuid())
        .bind(report.date_range.from)
        .bind(report.date_range.to)
        .bind(report.date_range.tz.name())
        .bind(report.total_sales_amount)
        .bind(items)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        row_to_stored(&row)
    }

    #[instrument(skip(self), fields(report_id = %id), err)]
    async fn get(&self, id: ReportId) -> Result<Option<StoredReport>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, range_from, range_to, tz, total_sales_amount, items, created_at
            FROM daily_reports
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_stored).transpose()
    }

    #[instrument(skip(self, filter), err)]
    async fn list(&self, filter: &ReportFilter, page: Page) -> Result<ReportPage, StoreError> {
        let limit = page.limit.max(1);
        let page_no = page.page.max(1);
        let offset = (page_no as i64 - 1) * limit as i64;

        let rows = sqlx::query(
            r#"
            SELECT id, range_from, range_to, tz, total_sales_amount, items, created_at
            FROM daily_reports
            WHERE ($1::timestamptz IS NULL OR range_from >= $1)
              AND ($2::timestamptz IS NULL OR range_from <= $2)
            ORDER BY range_from DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.from)
        .bind(filter.to)
        .bind(limit as i64)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM daily_reports
            WHERE ($1::timestamptz IS NULL OR range_from >= $1)
              AND ($2::timestamptz IS NULL OR range_from <= $2)
            "#,
        )
        .bind(filter.from)
        .bind(filter.to)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let items = rows
            .iter()
            .map(row_to_stored)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReportPage {
            page: page_no,
            limit,
            total: total as usize,
            items,
        })
    }
}
