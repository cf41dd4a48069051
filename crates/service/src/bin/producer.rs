//! Producer: aggregates yesterday's sales and publishes the report on a cron
//! schedule. `--once` runs a single publish and exits.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use salesfeed_broker::{ChannelManager, RedisQueue};
use salesfeed_pipeline::{PublishError, Publisher, publish_daily_report, run_scheduler};
use salesfeed_reports::{ComputeOpts, ReportStore, TransactionSource};
use salesfeed_service::{Config, shutdown_signal};

async fn produce_once(
    source: Arc<dyn TransactionSource>,
    publisher: Arc<Publisher<Arc<RedisQueue>>>,
    store: Option<Arc<dyn ReportStore>>,
    opts: ComputeOpts,
) -> Result<(), PublishError> {
    let report = publish_daily_report(&*source, &publisher, &opts).await?;
    // Producer-side copy; the consumer owns the authoritative save.
    if let Some(store) = store {
        if let Err(e) = store.save(&report).await {
            error!(error = %e, "failed to store published report locally");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    salesfeed_observability::init();

    let config = Config::from_env()?;
    let once = std::env::args().any(|arg| arg == "--once");

    let manager = Arc::new(ChannelManager::new(&config.broker_url)?);
    let queue = Arc::new(RedisQueue::new(
        manager,
        &config.queue_name,
        config.prefetch,
    ));
    let publisher = Arc::new(Publisher::new(queue));
    let source = salesfeed_service::build_source(&config).await?;
    let store = match &config.database_url {
        Some(_) => Some(salesfeed_service::build_store(&config).await?),
        None => None,
    };
    let opts = ComputeOpts {
        date: None,
        tz: Some(config.tz),
    };

    if once {
        produce_once(source, publisher, store, opts).await?;
        info!("one-off report published");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    run_scheduler(config.schedule.clone(), shutdown, move || {
        produce_once(source.clone(), publisher.clone(), store.clone(), opts)
    })
    .await;

    Ok(())
}
