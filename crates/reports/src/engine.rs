//! Timezone-aware daily aggregation.
//!
//! The target day is a civil-time day in an IANA timezone; its bounds are
//! converted to UTC before querying the transaction source. Aggregation is
//! deterministic: line items are grouped in a `BTreeMap`, so summation order
//! is fixed regardless of how the source returns rows.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use salesfeed_core::round2;

use crate::model::{DailyReport, DateRange, ReportItem, ReportKind};

/// Default reporting timezone when none is configured.
pub const DEFAULT_TZ: Tz = chrono_tz::Europe::Berlin;

/// Options for [`compute_daily_report`].
///
/// With no `date`, the target day is *yesterday in `tz`* — not yesterday in
/// the server's local time, which differs around midnight at other offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeOpts {
    pub date: Option<NaiveDate>,
    pub tz: Option<Tz>,
}

/// One transaction line item as returned by the transaction storage
/// collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub sku: String,
    pub quantity: u64,
    pub unit_price: f64,
}

/// Failure from the (external) transaction storage collaborator.
#[derive(Debug, Clone, Error)]
#[error("transaction source error: {0}")]
pub struct SourceError(pub String);

/// Read-only query capability over transaction storage.
///
/// Returns every line item whose transaction falls inside the UTC window
/// (both bounds inclusive).
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn line_items_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LineItem>, SourceError>;
}

/// Compute the UTC bounds of one calendar day in `tz`.
///
/// `to` is the last millisecond of the day. A local midnight that does not
/// exist (DST gap) falls back to the UTC interpretation of the naive time.
pub fn day_range_utc(opts: &ComputeOpts) -> DateRange {
    let tz = opts.tz.unwrap_or(DEFAULT_TZ);
    let date = opts
        .date
        .unwrap_or_else(|| yesterday_in(tz, Utc::now()));

    let from = start_of_day_utc(date, tz);
    let next = date.checked_add_days(Days::new(1)).unwrap_or(date);
    let to = start_of_day_utc(next, tz) - Duration::milliseconds(1);

    DateRange { from, to, tz }
}

fn yesterday_in(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz)
        .date_naive()
        .checked_sub_days(Days::new(1))
        .unwrap_or_else(|| now.with_timezone(&tz).date_naive())
}

fn start_of_day_utc(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    naive
        .and_local_timezone(tz)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

/// Aggregate one day of transactions into a [`DailyReport`].
///
/// Pure with respect to the source: the same arguments against unchanged data
/// produce an identical report. An empty window yields an empty `items` list
/// and a zero total, not an error.
pub async fn compute_daily_report(
    source: &dyn TransactionSource,
    opts: &ComputeOpts,
) -> Result<DailyReport, SourceError> {
    let range = day_range_utc(opts);
    let rows = source.line_items_between(range.from, range.to).await?;

    #[derive(Default)]
    struct SkuTotals {
        quantity: u64,
        amount: f64,
    }

    let mut by_sku: BTreeMap<String, SkuTotals> = BTreeMap::new();
    for row in rows {
        let entry = by_sku.entry(row.sku).or_default();
        entry.quantity += row.quantity;
        entry.amount += row.quantity as f64 * row.unit_price;
    }

    // Per-SKU amounts feed the total and are then discarded: items carry
    // quantity only (a deliberate reporting asymmetry).
    let total: f64 = by_sku.values().map(|t| t.amount).sum();
    let items = by_sku
        .into_iter()
        .map(|(sku, totals)| ReportItem {
            sku,
            total_quantity: totals.quantity,
        })
        .collect();

    Ok(DailyReport {
        kind: ReportKind::DailySalesReport,
        date_range: range,
        total_sales_amount: round2(total),
        items,
    })
}
