//! Persisted operation history.
//!
//! One flat row per finished operation, keyed by task id. Writes are
//! best-effort from the pipeline's point of view: a history failure is
//! logged and never changes how a message is acknowledged.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::model::{OperationRecord, OperationResult, OperationStatus};

#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTaskHistory;

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Errors raised by history stores.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// One finished operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub operation_number: Option<String>,
    pub amount: Option<Decimal>,
    pub date: Option<String>,
    pub cash_register: Option<String>,
    pub third_party: Option<String>,
    pub nature: Option<String>,
    pub description: Option<String>,
    pub total_line_items: u32,
    pub status: OperationStatus,
    pub started_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub raw_data: Option<Value>,
}

impl HistoryEntry {
    /// Entry for a result whose record never decoded.
    pub fn from_result(task_id: impl Into<String>, result: &OperationResult) -> Self {
        Self {
            task_id: task_id.into(),
            operation_number: result.operation_number.clone(),
            amount: result.operation_total.or(result.line_items_sum),
            date: None,
            cash_register: None,
            third_party: None,
            nature: None,
            description: None,
            total_line_items: 0,
            status: result.status,
            started_at: result.started_at,
            completed_at: result.ended_at,
            duration_seconds: result.duration_seconds(),
            error_message: result.error.clone(),
            raw_data: None,
        }
    }

    /// Fill in the header fields from the decoded record.
    pub fn with_record(mut self, record: &OperationRecord) -> Self {
        self.date = Some(record.date.clone());
        self.cash_register = Some(record.cash_register_id.clone());
        self.third_party = Some(record.third_party_id.clone());
        self.nature = Some(record.nature.as_str().to_string());
        self.description = record.description.clone();
        self.total_line_items = record.line_items.len() as u32;
        if self.amount.is_none() {
            self.amount = record.expected_total().ok();
        }
        self
    }

    pub fn with_raw_data(mut self, raw: Value) -> Self {
        self.raw_data = Some(raw);
        self
    }
}

/// Aggregate figures over the whole history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub average_duration_seconds: Option<f64>,
}

impl HistoryStats {
    pub fn count(&self, status: OperationStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Interface for operation history storage.
///
/// Implementations:
/// - `SqliteTaskHistory`: SQLite via sqlx
#[async_trait]
pub trait TaskHistory: Send + Sync {
    /// Insert or replace the row for `entry.task_id`.
    async fn save(&self, entry: &HistoryEntry) -> Result<()>;

    async fn get(&self, task_id: &str) -> Result<Option<HistoryEntry>>;

    /// Most recent first.
    async fn list(
        &self,
        limit: Option<u32>,
        status: Option<OperationStatus>,
    ) -> Result<Vec<HistoryEntry>>;

    async fn statistics(&self) -> Result<HistoryStats>;

    /// Delete rows started before `cutoff`. Returns the number removed.
    async fn clear_before(&self, cutoff: DateTime<Local>) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::transform;
    use serde_json::json;

    #[test]
    fn test_entry_from_record_and_result() {
        let record = transform(&json!({
            "fecha": "08112024",
            "caja": "204",
            "tercero": "43000000M",
            "naturaleza": "5",
            "texto_sical": [{"tcargo": "COBRO"}],
            "aplicaciones": [
                {"economica": "130", "importe": 10.5},
                {"economica": "300", "importe": 0.0}
            ]
        }))
        .unwrap();
        let result = OperationResult::rejected("session open failed");

        let entry = HistoryEntry::from_result("t-1", &result).with_record(&record);

        assert_eq!(entry.task_id, "t-1");
        assert_eq!(entry.status, OperationStatus::Failed);
        assert_eq!(entry.cash_register.as_deref(), Some("204"));
        assert_eq!(entry.nature.as_deref(), Some("5"));
        assert_eq!(entry.total_line_items, 2);
        assert_eq!(entry.amount, Some(Decimal::new(105, 1)));
        assert_eq!(entry.error_message.as_deref(), Some("session open failed"));
        assert!(entry.duration_seconds.is_some());
    }

    #[test]
    fn test_stats_count() {
        let mut stats = HistoryStats::default();
        stats.by_status.insert("COMPLETED".to_string(), 4);
        assert_eq!(stats.count(OperationStatus::Completed), 4);
        assert_eq!(stats.count(OperationStatus::Failed), 0);
    }
}
