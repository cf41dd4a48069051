//! Cron-driven producer loop.
//!
//! Occurrences are computed in the reporting timezone, so "noon daily" means
//! noon in that zone year-round, across DST shifts. A failed run is logged
//! and the loop continues to the next occurrence; only shutdown stops it.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expr:?}: {message}")]
    InvalidExpression { expr: String, message: String },
}

/// A cron schedule anchored to a timezone.
#[derive(Debug, Clone)]
pub struct Schedule {
    cron: cron::Schedule,
    tz: Tz,
}

impl Schedule {
    /// Parse a six-field (seconds-first) cron expression.
    pub fn parse(expr: &str, tz: Tz) -> Result<Self, ScheduleError> {
        let cron = cron::Schedule::from_str(expr).map_err(|e| ScheduleError::InvalidExpression {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { cron, tz })
    }

    /// Next occurrence strictly after `now`, as a UTC instant.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron
            .after(&now.with_timezone(&self.tz))
            .next()
            .map(|occurrence| occurrence.with_timezone(&Utc))
    }
}

/// Run `run_once` at every schedule occurrence until `shutdown` fires.
pub async fn run_scheduler<F, Fut, E>(schedule: Schedule, shutdown: CancellationToken, mut run_once: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    loop {
        let Some(next) = schedule.next_after(Utc::now()) else {
            warn!("schedule has no further occurrences; stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        info!(next = %next, "waiting for next scheduled run");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("scheduler shutting down");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = run_once().await {
            error!(error = %e, "scheduled run failed; will retry at next occurrence");
        }
    }
}
