//! Consumer: drains the report queue, persisting each report with the retry
//! state machine and notifying on delivery.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use salesfeed_broker::{ChannelManager, RedisQueue};
use salesfeed_pipeline::{Consumer, TracingNotifier};
use salesfeed_reports::ReportStore;
use salesfeed_service::{Config, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    salesfeed_observability::init();

    let config = Config::from_env()?;

    let manager = Arc::new(ChannelManager::new(&config.broker_url)?);
    let queue = Arc::new(RedisQueue::new(
        manager,
        &config.queue_name,
        config.prefetch,
    ));
    let store: Arc<dyn ReportStore> = salesfeed_service::build_store(&config).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let consumer = Arc::new(Consumer::new(
        queue,
        store,
        Arc::new(TracingNotifier),
        config.retry_policy.clone(),
        shutdown,
    ));
    consumer.run().await;

    Ok(())
}
