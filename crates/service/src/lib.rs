//! `salesfeed-service` — configuration and process wiring for the producer
//! and consumer binaries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use salesfeed_reports::{LineItem, ReportStore, SourceError, TransactionSource};

pub mod config;

pub use config::{Config, ConfigError};

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Transaction source that never has any line items. Stands in when no
/// database is configured, so the wiring still runs end to end.
pub struct EmptySource;

#[async_trait]
impl TransactionSource for EmptySource {
    async fn line_items_between(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<LineItem>, SourceError> {
        Ok(Vec::new())
    }
}

/// Report store chosen from the configuration: Postgres when a database URL
/// is configured (and the `postgres` feature is on), in-memory otherwise.
pub async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ReportStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        return Ok(Arc::new(salesfeed_reports::PostgresReportStore::new(pool)));
    }

    if config.database_url.is_some() {
        warn!("DATABASE_URL set but this build has no postgres support; using in-memory store");
    } else {
        warn!("DATABASE_URL not set; reports are stored in memory only");
    }
    Ok(Arc::new(salesfeed_reports::InMemoryReportStore::new()))
}

/// Transaction source chosen from the configuration.
pub async fn build_source(config: &Config) -> anyhow::Result<Arc<dyn TransactionSource>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        return Ok(Arc::new(salesfeed_reports::PostgresTransactionSource::new(
            pool,
        )));
    }

    let _ = config;
    warn!("no transaction database configured; reports will be empty");
    Ok(Arc::new(EmptySource))
}
