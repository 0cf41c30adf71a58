//! AMQP (RabbitMQ) transport.
//!
//! Consumes the inbound queue one delivery at a time with manual
//! acknowledgment, and publishes results to the fixed results queue through
//! the default exchange.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties,
};
use tracing::{debug, error, info, warn, Instrument};

use super::{BusError, Disposition, ResultMessage, ResultPublisher, Result};
use crate::config::AmqpSettings;
use crate::consumer::QueueConsumer;
use crate::observer::{EventKind, ObserverEvent};

const CONSUMER_TAG: &str = "arqueo-worker";

fn build_pool(settings: &AmqpSettings) -> Result<Pool> {
    let manager = Manager::new(settings.url(), ConnectionProperties::default());
    Pool::builder(manager)
        .max_size(2)
        .build()
        .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))
}

async fn get_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        BusError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("Failed to declare queue {}: {}", queue, e)))?;
    Ok(())
}

/// Properties for a published result: persistent JSON, tagged with the
/// inbound correlation id.
fn result_properties(correlation_id: Option<&str>) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2); // persistent

    match correlation_id {
        Some(id) => properties.with_correlation_id(id.into()),
        None => properties,
    }
}

/// Why a delivery stream stopped being drained.
#[derive(Debug)]
enum StreamEnd<E> {
    Shutdown,
    Closed,
    Failed(E),
}

/// Hand deliveries to `handle` one at a time until the stream ends or
/// `shutdown` fires.
///
/// Shutdown is only checked while waiting for the next delivery. A delivery
/// that has been pulled is always handled to completion.
async fn drain_until_shutdown<S, T, E, F, H, Fut>(
    deliveries: &mut S,
    mut shutdown: Pin<&mut F>,
    mut handle: H,
) -> StreamEnd<E>
where
    S: Stream<Item = std::result::Result<T, E>> + Unpin,
    F: Future<Output = ()>,
    H: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => return StreamEnd::Shutdown,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => handle(delivery).await,
            Some(Err(e)) => return StreamEnd::Failed(e),
            None => return StreamEnd::Closed,
        }
    }
}

/// Inbound queue consumer with automatic reconnection.
pub struct AmqpConsumer {
    pool: Pool,
    settings: AmqpSettings,
}

impl AmqpConsumer {
    /// Create a consumer. No connection is made until [`run`](Self::run).
    pub fn new(settings: AmqpSettings) -> Result<Self> {
        Ok(Self {
            pool: build_pool(&settings)?,
            settings,
        })
    }

    /// A publisher sharing this consumer's connection pool.
    pub fn publisher(&self) -> AmqpResultPublisher {
        AmqpResultPublisher {
            pool: self.pool.clone(),
            results_queue: self.settings.results_queue.clone(),
        }
    }

    /// Consume until `shutdown` resolves.
    ///
    /// A delivery already handed to the pipeline is processed and settled
    /// before the consumer stops; shutdown only interrupts waits.
    pub async fn run<F>(&self, consumer: &QueueConsumer, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.consume_with_reconnect(consumer, shutdown).await;
        info!(queue = %self.settings.inbound_queue, "Consumer stopped");
        self.pool.close();
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn consume_with_reconnect<F>(&self, consumer: &QueueConsumer, mut shutdown: Pin<&mut F>)
    where
        F: Future<Output = ()>,
    {
        let queue = &self.settings.inbound_queue;
        let notifier = consumer.notifier();

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            notifier.emit(ObserverEvent::new(EventKind::Connecting).with("queue", queue.as_str()));

            let setup = tokio::select! {
                setup = self.setup_consumer() => setup,
                _ = &mut shutdown => return,
            };

            match setup {
                Ok(mut deliveries) => {
                    notifier
                        .emit(ObserverEvent::new(EventKind::Connected).with("queue", queue.as_str()));
                    info!(
                        queue = %queue,
                        prefetch = self.settings.prefetch,
                        "Consumer connected, processing messages"
                    );
                    backoff_iter = backoff_builder.build();

                    let end = drain_until_shutdown(&mut deliveries, shutdown.as_mut(), |delivery| {
                        Self::process_delivery(delivery, consumer)
                    })
                    .await;

                    notifier.emit(
                        ObserverEvent::new(EventKind::Disconnected).with("queue", queue.as_str()),
                    );
                    match end {
                        StreamEnd::Shutdown => {
                            info!(queue = %queue, "Shutdown requested, no further deliveries");
                            return;
                        }
                        StreamEnd::Failed(e) => {
                            error!(error = %e, "Consumer delivery error, will reconnect")
                        }
                        StreamEnd::Closed => {
                            info!(queue = %queue, "Consumer stream ended, reconnecting...")
                        }
                    }
                }
                Err(e) => {
                    notifier.emit(
                        ObserverEvent::new(EventKind::Disconnected)
                            .with("queue", queue.as_str())
                            .with("error", e.to_string()),
                    );
                    error!(
                        error = %e,
                        queue = %queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            debug!(backoff_ms = %delay.as_millis(), "Waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => return,
            }
        }
    }

    /// Declare both queues, apply QoS, and start consuming.
    async fn setup_consumer(&self) -> Result<lapin::Consumer> {
        let channel = get_channel(&self.pool).await?;

        declare_durable(&channel, &self.settings.inbound_queue).await?;
        declare_durable(&channel, &self.settings.results_queue).await?;

        channel
            .basic_qos(self.settings.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to set QoS: {}", e)))?;

        channel
            .basic_consume(
                &self.settings.inbound_queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to start consumer: {}", e)))
    }

    async fn process_delivery(delivery: Delivery, consumer: &QueueConsumer) {
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string());

        debug!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Received delivery"
        );

        let span = tracing::info_span!(
            "bus.consume",
            correlation_id = correlation_id.as_deref().unwrap_or_default()
        );
        let disposition = consumer
            .handle(&delivery.data, correlation_id.as_deref())
            .instrument(span)
            .await;

        let settled = match disposition {
            Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
            Disposition::Requeue => {
                warn!(delivery_tag = delivery.delivery_tag, "Negative acknowledgment, requeueing");
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
        };
        if let Err(e) = settled {
            error!(error = %e, "Failed to settle delivery");
        }
    }
}

/// Publishes results to the results queue through the default exchange.
#[derive(Clone)]
pub struct AmqpResultPublisher {
    pool: Pool,
    results_queue: String,
}

impl AmqpResultPublisher {
    /// Create a standalone publisher with its own connection pool.
    pub fn new(settings: &AmqpSettings) -> Result<Self> {
        Ok(Self {
            pool: build_pool(settings)?,
            results_queue: settings.results_queue.clone(),
        })
    }
}

#[async_trait]
impl ResultPublisher for AmqpResultPublisher {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(queue = %self.results_queue))]
    async fn publish(&self, correlation_id: Option<&str>, message: &ResultMessage) -> Result<()> {
        let payload = message.to_json()?;
        let channel = get_channel(&self.pool).await?;

        let confirm = channel
            .basic_publish(
                "",
                &self.results_queue,
                BasicPublishOptions::default(),
                &payload,
                result_properties(correlation_id),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(
            routing_key = %self.results_queue,
            status = %message.status,
            "Published result"
        );
        Ok(())
    }
}
