//! arqueo-worker: reconciliation task consumer
//!
//! Consumes reconciliation tasks from RabbitMQ, drives the legacy accounting
//! application through the automation bridge, and publishes every outcome
//! to the results queue.
//!
//! ## Architecture
//! ```text
//! [sical_queue.arqueo] -> [arqueo-worker] -> [sical_results]
//!                               |
//!                               v
//!                      [automation bridge] -> [legacy application]
//! ```
//!
//! ## Configuration
//! - ARQUEO_CONFIG: Path to a YAML config file
//! - ARQUEO__<SECTION>__<KEY>: Override any config value
//! - RABBITMQ_HOST / RABBITMQ_PORT / RABBITMQ_USER / RABBITMQ_PASS: Broker
//! - ARQUEO_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::{error, info, warn};

use arqueo::bus::AmqpConsumer;
use arqueo::config::AppConfig;
use arqueo::consumer::QueueConsumer;
use arqueo::driver::http::HttpDriverConfig;
use arqueo::driver::HttpLegacyDriver;
use arqueo::observer::{Notifier, StatusTracker, TracingObserver};
use arqueo::orchestrator::Orchestrator;
use arqueo::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = AppConfig::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        host = %config.amqp.host,
        port = config.amqp.port,
        inbound_queue = %config.amqp.inbound_queue,
        results_queue = %config.amqp.results_queue,
        "Starting arqueo-worker"
    );

    let status = Arc::new(StatusTracker::new());
    let notifier = Notifier::new()
        .with_observer(Arc::new(TracingObserver))
        .with_observer(status.clone());

    let driver = HttpLegacyDriver::new(HttpDriverConfig::from(&config.driver))?;
    info!(base_url = %config.driver.base_url, "Legacy driver configured");

    let orchestrator = Orchestrator::new(Arc::new(driver), notifier.clone());
    let amqp = AmqpConsumer::new(config.amqp.clone())?;
    let mut consumer = QueueConsumer::new(orchestrator, Arc::new(amqp.publisher()), notifier);

    if config.history.enabled {
        consumer = attach_history(consumer, &config.history.path).await;
    }

    amqp.run(&consumer, shutdown_signal()).await;

    let snapshot = status.snapshot();
    info!(
        completed = snapshot.stats.completed,
        failed = snapshot.stats.failed,
        total_processed = snapshot.stats.total_processed,
        "arqueo-worker stopped"
    );

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn attach_history(consumer: QueueConsumer, path: &str) -> QueueConsumer {
    use arqueo::history::SqliteTaskHistory;

    match SqliteTaskHistory::open(path).await {
        Ok(history) => {
            info!(path = %path, "Task history enabled");
            consumer.with_history(Arc::new(history))
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Task history unavailable, continuing without it");
            consumer
        }
    }
}

#[cfg(not(feature = "sqlite"))]
async fn attach_history(consumer: QueueConsumer, _path: &str) -> QueueConsumer {
    warn!("Task history requested but the sqlite feature is disabled");
    consumer
}
