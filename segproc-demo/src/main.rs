use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use segproc_core::{
    BatchProcessor, Configuration, ConfigurationBuilder, Coordinator, EventMessage,
    InMemoryMessageSource, InMemoryTokenStore, ProcessorError, Segment, SegmentMatchValidator,
    UnitOfWork,
};
use tracing_subscriber::EnvFilter;

/// Prints every accepted event to stdout via `tracing` — stands in for the
/// real handler a host would supply.
struct LoggingProcessor;

#[async_trait]
impl BatchProcessor<String> for LoggingProcessor {
    async fn process_batch(
        &self,
        events: &[EventMessage<String>],
        _unit_of_work: &UnitOfWork,
        segment: &Segment,
    ) -> Result<(), ProcessorError> {
        for event in events {
            tracing::info!(
                segment = segment.id(),
                token = event.token().0,
                payload = %event.payload(),
                "handled event"
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let token_store = Arc::new(InMemoryTokenStore::new());
    let message_source: Arc<InMemoryMessageSource<String>> =
        Arc::new(InMemoryMessageSource::new());

    let config: Arc<Configuration> = Arc::new(
        ConfigurationBuilder::new()
            .name("demo-processor")
            .initial_segment_count(4)
            .claim_extension_threshold(Duration::from_secs(5))
            .build()?,
    );

    let coordinator = Coordinator::new(
        "demo-processor",
        config,
        token_store,
        message_source.clone(),
        Arc::new(SegmentMatchValidator),
        Arc::new(LoggingProcessor),
    );

    coordinator.start();
    tracing::info!("coordinator started");

    for i in 0..8u64 {
        message_source.append(i, format!("order-{i}"));
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    for (segment_id, status) in coordinator.status_registry().all() {
        tracing::info!(
            segment_id,
            token = status.current_token.0,
            "segment status"
        );
    }

    coordinator.stop().await;
    tracing::info!("coordinator stopped");

    Ok(())
}
