//! Per-message pipeline: parse, transform, orchestrate, publish.
//!
//! Transport-agnostic. The AMQP consumer feeds deliveries to
//! [`QueueConsumer::handle`] one at a time and acts on the returned
//! [`Disposition`].

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bus::{Disposition, ResultMessage, ResultPublisher, TaskEnvelope};
use crate::history::{HistoryEntry, TaskHistory};
use crate::model::{OperationRecord, OperationResult};
use crate::observer::{EventKind, Notifier, ObserverEvent};
use crate::orchestrator::Orchestrator;
use crate::transform::transform;

/// Handles one inbound message end to end.
pub struct QueueConsumer {
    orchestrator: Orchestrator,
    publisher: Arc<dyn ResultPublisher>,
    notifier: Notifier,
    history: Option<Arc<dyn TaskHistory>>,
}

impl QueueConsumer {
    pub fn new(
        orchestrator: Orchestrator,
        publisher: Arc<dyn ResultPublisher>,
        notifier: Notifier,
    ) -> Self {
        Self {
            orchestrator,
            publisher,
            notifier,
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn TaskHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Process one message body.
    ///
    /// Business outcomes (including FAILED, P_DUPLICATED and INCOMPLETED) are
    /// acknowledged. Only an unreadable message or a failed publish asks for
    /// redelivery.
    #[tracing::instrument(name = "consumer.handle", skip_all, fields(correlation_id = correlation_id.unwrap_or_default()))]
    pub async fn handle(&self, body: &[u8], correlation_id: Option<&str>) -> Disposition {
        let envelope = match TaskEnvelope::parse(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Discarding unreadable message for redelivery");
                self.notifier.emit(
                    ObserverEvent::new(EventKind::TaskFailed).with("error", e.to_string()),
                );
                return Disposition::Requeue;
            }
        };

        let task_id = envelope
            .task_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        info!(task_id = %task_id, kind = envelope.kind.as_deref().unwrap_or_default(), "Received task");
        self.notifier
            .emit(ObserverEvent::new(EventKind::TaskReceived).with("task_id", task_id.as_str()));

        let (record, result) = match transform(&envelope.payload) {
            Ok(record) => {
                self.notifier.emit(started_event(&task_id, &record));
                let result = self.orchestrator.run(&task_id, &record).await;
                (Some(record), result)
            }
            Err(e) if e.is_validation() => {
                warn!(task_id = %task_id, error = %e, "Operation rejected");
                (None, OperationResult::rejected(e.to_string()))
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Malformed operation payload");
                self.notifier.emit(
                    ObserverEvent::new(EventKind::TaskFailed)
                        .with("task_id", task_id.as_str())
                        .with("error", e.to_string()),
                );
                return Disposition::Requeue;
            }
        };

        self.record_history(&task_id, record.as_ref(), &result, &envelope)
            .await;

        let message = ResultMessage::new(envelope.task_id.clone(), result);
        if let Err(e) = self.publisher.publish(correlation_id, &message).await {
            error!(task_id = %task_id, error = %e, "Result not published, requeueing");
            self.notifier.emit(
                ObserverEvent::new(EventKind::TaskFailed)
                    .with("task_id", task_id.as_str())
                    .with("error", e.to_string()),
            );
            return Disposition::Requeue;
        }

        self.notifier.emit(
            ObserverEvent::new(EventKind::TaskCompleted)
                .with("task_id", task_id.as_str())
                .with("status", message.status.as_str()),
        );
        info!(task_id = %task_id, status = %message.status, "Task processed");

        Disposition::Ack
    }

    async fn record_history(
        &self,
        task_id: &str,
        record: Option<&OperationRecord>,
        result: &OperationResult,
        envelope: &TaskEnvelope,
    ) {
        let Some(history) = &self.history else {
            return;
        };

        let mut entry = HistoryEntry::from_result(task_id, result)
            .with_raw_data(envelope.payload.clone());
        if let Some(record) = record {
            entry = entry.with_record(record);
        }

        if let Err(e) = history.save(&entry).await {
            warn!(task_id = %task_id, error = %e, "History not saved");
        }
    }
}

fn started_event(task_id: &str, record: &OperationRecord) -> ObserverEvent {
    ObserverEvent::new(EventKind::TaskStarted)
        .with("task_id", task_id)
        .with("date", record.date.as_str())
        .with("cash_register", record.cash_register_id.as_str())
        .with("file_reference", record.file_reference.as_str())
        .with("third_party", record.third_party_id.as_str())
        .with("nature", record.nature.as_str())
        .with("description", record.description.clone().unwrap_or_default())
        .with("total_line_items", record.positive_line_count() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockResultPublisher;
    use crate::driver::MockLegacyDriver;
    use crate::model::OperationStatus;
    use crate::observer::StatusTracker;
    use serde_json::json;

    fn body(operation: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "task_id": "t-1",
            "operation_data": {"operation": {"tipo": "arqueo", "detalle": operation}}
        }))
        .unwrap()
    }

    fn consumer(publisher: Arc<MockResultPublisher>, tracker: Arc<StatusTracker>) -> QueueConsumer {
        let notifier = Notifier::new().with_observer(tracker);
        let orchestrator =
            Orchestrator::new(Arc::new(MockLegacyDriver::new()), notifier.clone());
        QueueConsumer::new(orchestrator, publisher, notifier)
    }

    #[tokio::test]
    async fn test_completed_task_is_acked_and_published() {
        let publisher = Arc::new(MockResultPublisher::new());
        let tracker = Arc::new(StatusTracker::new());
        let consumer = consumer(publisher.clone(), tracker.clone());

        let disposition = consumer
            .handle(
                &body(json!({
                    "fecha": "08112024", "caja": "204", "tercero": "43000000M",
                    "naturaleza": "4",
                    "aplicaciones": [{"economica": "130", "importe": 10}]
                })),
                Some("corr-1"),
            )
            .await;

        assert_eq!(disposition, Disposition::Ack);
        let published = publisher.take_published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(published[0].message.operation_id.as_deref(), Some("t-1"));
        assert_eq!(published[0].message.status, OperationStatus::Completed);
        assert_eq!(tracker.snapshot().stats.completed, 1);
    }

    #[tokio::test]
    async fn test_invalid_amount_is_published_as_failed() {
        let publisher = Arc::new(MockResultPublisher::new());
        let consumer = consumer(publisher.clone(), Arc::new(StatusTracker::new()));

        let disposition = consumer
            .handle(
                &body(json!({
                    "fecha": "08112024", "caja": "204", "tercero": "43000000M",
                    "aplicaciones": [{"economica": "130", "importe": "12,3,4"}]
                })),
                None,
            )
            .await;

        assert_eq!(disposition, Disposition::Ack);
        let published = publisher.take_published().await;
        assert_eq!(published[0].message.status, OperationStatus::Failed);
        assert!(published[0]
            .message
            .result
            .error
            .as_deref()
            .unwrap()
            .starts_with("Validation error"));
    }

    #[tokio::test]
    async fn test_malformed_message_is_requeued() {
        let publisher = Arc::new(MockResultPublisher::new());
        let tracker = Arc::new(StatusTracker::new());
        let consumer = consumer(publisher.clone(), tracker.clone());

        assert_eq!(consumer.handle(b"{", None).await, Disposition::Requeue);
        assert_eq!(
            consumer.handle(&body(json!({"caja": "204"})), None).await,
            Disposition::Requeue
        );
        assert_eq!(publisher.published_count().await, 0);
        assert_eq!(tracker.snapshot().stats.failed, 2);
    }

    #[tokio::test]
    async fn test_publish_failure_is_requeued() {
        let publisher = Arc::new(MockResultPublisher::new());
        publisher.set_fail_on_publish(true).await;
        let consumer = consumer(publisher.clone(), Arc::new(StatusTracker::new()));

        let disposition = consumer
            .handle(
                &body(json!({"fecha": "08112024", "caja": "204", "tercero": "43000000M"})),
                None,
            )
            .await;

        assert_eq!(disposition, Disposition::Requeue);
    }
}
