//! End-to-end pipeline tests with in-memory doubles.
//!
//! Message body -> QueueConsumer -> Orchestrator -> MockLegacyDriver
//!                                            \-> MockResultPublisher

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use arqueo::bus::{Disposition, MockResultPublisher, PublishedResult};
use arqueo::consumer::QueueConsumer;
use arqueo::driver::{DriverCall, FailPoint, FieldInput, MockLegacyDriver, QueryOutcome};
use arqueo::history::{self, HistoryEntry, HistoryStats, TaskHistory};
use arqueo::model::OperationStatus;
use arqueo::observer::{Notifier, StatusTracker};
use arqueo::orchestrator::Orchestrator;

/// History double that keeps saved entries in memory.
#[derive(Default)]
struct MemoryHistory(Mutex<Vec<HistoryEntry>>);

#[async_trait]
impl TaskHistory for MemoryHistory {
    async fn save(&self, entry: &HistoryEntry) -> history::Result<()> {
        let mut entries = self.0.lock().unwrap();
        entries.retain(|e| e.task_id != entry.task_id);
        entries.push(entry.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> history::Result<Option<HistoryEntry>> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.task_id == task_id)
            .cloned())
    }

    async fn list(
        &self,
        _limit: Option<u32>,
        _status: Option<OperationStatus>,
    ) -> history::Result<Vec<HistoryEntry>> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn statistics(&self) -> history::Result<HistoryStats> {
        Ok(HistoryStats::default())
    }

    async fn clear_before(&self, _cutoff: DateTime<Local>) -> history::Result<u64> {
        Ok(0)
    }
}

struct Harness {
    driver: Arc<MockLegacyDriver>,
    publisher: Arc<MockResultPublisher>,
    tracker: Arc<StatusTracker>,
    history: Arc<MemoryHistory>,
    consumer: QueueConsumer,
}

fn harness(driver: MockLegacyDriver) -> Harness {
    let driver = Arc::new(driver);
    let publisher = Arc::new(MockResultPublisher::new());
    let tracker = Arc::new(StatusTracker::new());
    let history = Arc::new(MemoryHistory::default());

    let notifier = Notifier::new().with_observer(tracker.clone());
    let orchestrator = Orchestrator::new(driver.clone(), notifier.clone());
    let consumer = QueueConsumer::new(orchestrator, publisher.clone(), notifier)
        .with_history(history.clone());

    Harness {
        driver,
        publisher,
        tracker,
        history,
        consumer,
    }
}

fn message(task_id: &str, detalle: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "task_id": task_id,
        "operation_data": {"operation": {"tipo": "arqueo", "detalle": detalle}}
    }))
    .unwrap()
}

fn income(description: &str) -> Value {
    json!({
        "fecha": "08112024",
        "caja": "204",
        "tercero": "43000000M",
        "naturaleza": "5",
        "texto_sical": [{"tcargo": description}],
        "aplicaciones": [
            {"economica": "30012", "importe": 5000.0, "contraido": true, "year": "2024"},
            {"economica": "130", "importe": 250.5, "contraido": false}
        ]
    })
}

async fn single_result(publisher: &MockResultPublisher) -> PublishedResult {
    let mut published = publisher.take_published().await;
    assert_eq!(published.len(), 1, "expected exactly one published result");
    published.remove(0)
}

#[tokio::test]
async fn test_finalized_income_end_to_end() {
    let h = harness(
        MockLegacyDriver::new()
            .with_total("5.250,50")
            .with_operation_number("120240001234"),
    );

    let disposition = h
        .consumer
        .handle(&message("t-100", income("RECAUDADO TRIBUTOS /F")), Some("corr-100"))
        .await;

    assert_eq!(disposition, Disposition::Ack);
    let published = single_result(&h.publisher).await;
    assert_eq!(published.correlation_id.as_deref(), Some("corr-100"));
    assert_eq!(published.message.operation_id.as_deref(), Some("t-100"));
    assert_eq!(published.message.status, OperationStatus::Completed);

    let result = &published.message.result;
    assert_eq!(result.operation_number.as_deref(), Some("120240001234"));
    assert_eq!(result.line_items_sum, Some(Decimal::new(52505, 1)));
    assert_eq!(result.operation_total, Some(Decimal::new(525050, 2)));
    assert!(result.legacy_session_open);
    assert!(result.duration.is_some());

    let calls = h.driver.calls();
    let DriverCall::QueryDuplicates(filter) = &calls[0] else {
        panic!("first call should be the duplicate query, got {:?}", calls[0]);
    };
    assert_eq!(filter.third_party_id, "43000000M");
    assert_eq!(filter.cash_register_id, "204");
    assert!(h.driver.fields().contains(&FieldInput::NewLinkedReference));

    let entry = h.history.get("t-100").await.unwrap().expect("history saved");
    assert_eq!(entry.status, OperationStatus::Completed);
    assert_eq!(entry.description.as_deref(), Some("RECAUDADO TRIBUTOS"));
    assert_eq!(entry.total_line_items, 2);

    let snapshot = h.tracker.snapshot();
    assert_eq!(snapshot.stats.completed, 1);
    assert_eq!(snapshot.stats.total_processed, 1);
    assert!(snapshot.current_task.is_none());
}

#[tokio::test]
async fn test_duplicate_is_acked_without_touching_the_form() {
    let h = harness(MockLegacyDriver::new().with_duplicates(QueryOutcome::Count(3)));

    let disposition = h
        .consumer
        .handle(&message("t-101", income("COBRO /F")), None)
        .await;

    assert_eq!(disposition, Disposition::Ack);
    let published = single_result(&h.publisher).await;
    assert_eq!(published.message.status, OperationStatus::PDuplicated);
    assert_eq!(published.message.result.similar_records_count, 3);
    assert_eq!(h.driver.sessions_opened(), 0);
    assert_eq!(h.tracker.snapshot().stats.failed, 1);
}

#[tokio::test]
async fn test_print_failure_is_acked_as_incompleted() {
    let h = harness(
        MockLegacyDriver::new()
            .with_operation_number("77")
            .failing_at(FailPoint::Print),
    );

    let disposition = h
        .consumer
        .handle(&message("t-102", income("COBRO /F")), None)
        .await;

    assert_eq!(disposition, Disposition::Ack);
    let published = single_result(&h.publisher).await;
    assert_eq!(published.message.status, OperationStatus::Incompleted);
    assert_eq!(published.message.result.operation_number.as_deref(), Some("77"));
    assert_eq!(h.driver.count(&DriverCall::CleanupError), 1);
}

#[tokio::test]
async fn test_unavailable_session_is_acked_as_failed() {
    let h = harness(MockLegacyDriver::new().without_session());

    let disposition = h.consumer.handle(&message("t-103", income("COBRO")), None).await;

    assert_eq!(disposition, Disposition::Ack);
    let published = single_result(&h.publisher).await;
    assert_eq!(published.message.status, OperationStatus::Failed);
    assert!(!published.message.result.legacy_session_open);
}

#[tokio::test]
async fn test_unparsable_body_is_requeued_without_result() {
    let h = harness(MockLegacyDriver::new());

    let disposition = h.consumer.handle(b"\x00not-json", Some("corr-x")).await;

    assert_eq!(disposition, Disposition::Requeue);
    assert_eq!(h.publisher.published_count().await, 0);
    assert!(h.driver.calls().is_empty());
    assert!(h.history.list(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_legacy_envelope_shape_is_accepted() {
    let h = harness(MockLegacyDriver::new());
    let body = serde_json::to_vec(&json!({
        "task_id": "t-104",
        "operation_data": {"operation": income("COBRO")}
    }))
    .unwrap();

    let disposition = h.consumer.handle(&body, None).await;

    assert_eq!(disposition, Disposition::Ack);
    let published = single_result(&h.publisher).await;
    assert_eq!(published.message.status, OperationStatus::Completed);
    assert!(published.message.result.operation_number.is_none());
}

#[tokio::test]
async fn test_messages_are_processed_in_order() {
    let h = harness(MockLegacyDriver::new());

    for task_id in ["a", "b", "c"] {
        let disposition = h.consumer.handle(&message(task_id, income("COBRO")), None).await;
        assert_eq!(disposition, Disposition::Ack);
    }

    let ids: Vec<_> = h
        .publisher
        .take_published()
        .await
        .into_iter()
        .map(|p| p.message.operation_id.unwrap_or_default())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(h.driver.sessions_opened(), 3);
    assert_eq!(h.tracker.snapshot().stats.total_processed, 3);
}

#[tokio::test]
async fn test_total_beyond_decimal_range_is_rejected_not_crashed() {
    let h = harness(MockLegacyDriver::new());
    let max = Decimal::MAX.to_string();
    let mut detalle = income("COBRO /F");
    detalle["aplicaciones"] = json!([
        {"economica": "130", "importe": max},
        {"economica": "130", "importe": max}
    ]);

    let disposition = h.consumer.handle(&message("t-105", detalle), None).await;

    assert_eq!(disposition, Disposition::Ack);
    let published = single_result(&h.publisher).await;
    assert_eq!(published.message.status, OperationStatus::Failed);
    let error = published.message.result.error.clone().unwrap_or_default();
    assert!(error.starts_with("Validation error"), "{}", error);
    assert!(h.driver.calls().is_empty());

    let entry = h.history.get("t-105").await.unwrap().expect("history saved");
    assert_eq!(entry.status, OperationStatus::Failed);
    assert_eq!(h.tracker.snapshot().stats.pending, 0);
}

#[tokio::test]
async fn test_tracker_counters_settle_for_rejected_and_malformed_tasks() {
    let h = harness(MockLegacyDriver::new());
    let mut bad_amount = income("COBRO");
    bad_amount["aplicaciones"] = json!([{"economica": "130", "importe": "abc"}]);
    let mut no_date = income("COBRO");
    no_date.as_object_mut().unwrap().remove("fecha");

    assert_eq!(
        h.consumer.handle(&message("t-106", bad_amount), None).await,
        Disposition::Ack
    );
    assert_eq!(
        h.consumer.handle(&message("t-107", no_date), None).await,
        Disposition::Requeue
    );

    let stats = h.tracker.snapshot().stats;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.total_processed, 2);
}
