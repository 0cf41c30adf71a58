//! Operation status and result.

use std::fmt;

use chrono::{DateTime, Local};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle status of one operation.
///
/// `PENDING -> IN_PROGRESS -> {COMPLETED, INCOMPLETED, FAILED, P_DUPLICATED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    /// Fully processed; validated and printed when finalization was asked for.
    #[serde(rename = "COMPLETED")]
    Completed,
    /// Validated and numbered, but the document did not print.
    #[serde(rename = "INCOMPLETED")]
    Incompleted,
    #[serde(rename = "FAILED")]
    Failed,
    /// A matching prior record exists; nothing was written.
    #[serde(rename = "P_DUPLICATED")]
    PDuplicated,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::InProgress => "IN_PROGRESS",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Incompleted => "INCOMPLETED",
            OperationStatus::Failed => "FAILED",
            OperationStatus::PDuplicated => "P_DUPLICATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending | OperationStatus::InProgress)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Completed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one operation. Owned by the orchestrator until terminal, then
/// published as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub started_at: DateTime<Local>,
    pub ended_at: Option<DateTime<Local>>,
    /// `H:MM:SS[.ffffff]`
    pub duration: Option<String>,
    pub error: Option<String>,
    pub operation_number: Option<String>,
    pub operation_total: Option<Decimal>,
    pub line_items_sum: Option<Decimal>,
    pub legacy_session_open: bool,
    pub similar_records_count: u32,
}

impl OperationResult {
    /// A fresh `PENDING` result.
    pub fn pending(started_at: DateTime<Local>) -> Self {
        Self {
            status: OperationStatus::Pending,
            started_at,
            ended_at: None,
            duration: None,
            error: None,
            operation_number: None,
            operation_total: None,
            line_items_sum: None,
            legacy_session_open: false,
            similar_records_count: 0,
        }
    }

    /// Terminal result for an operation rejected before it began.
    pub fn rejected(message: impl Into<String>) -> Self {
        let now = Local::now();
        let mut result = Self::pending(now);
        result.fail(message);
        result.finish(now);
        result
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = OperationStatus::Failed;
        self.error = Some(message.into());
    }

    /// Stamp the end time and duration.
    pub fn finish(&mut self, ended_at: DateTime<Local>) {
        self.duration = Some(format_duration(ended_at - self.started_at));
        self.ended_at = Some(ended_at);
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_microseconds().unwrap_or(0) as f64 / 1e6)
    }
}

/// Format an elapsed time as `H:MM:SS`, with microseconds when non-zero.
pub fn format_duration(elapsed: chrono::Duration) -> String {
    let total_micros = elapsed.num_microseconds().unwrap_or(i64::MAX).max(0);
    let micros = total_micros % 1_000_000;
    let total_secs = total_micros / 1_000_000;
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs / 60) % 60, total_secs % 60);
    if micros == 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}:{:02}.{:06}", hours, minutes, seconds, micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_tags() {
        assert_eq!(
            serde_json::to_value(OperationStatus::PDuplicated).unwrap(),
            json!("P_DUPLICATED")
        );
        assert_eq!(
            serde_json::to_value(OperationStatus::InProgress).unwrap(),
            json!("IN_PROGRESS")
        );
        assert_eq!(OperationStatus::Incompleted.to_string(), "INCOMPLETED");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::InProgress.is_terminal());
        for status in [
            OperationStatus::Completed,
            OperationStatus::Incompleted,
            OperationStatus::Failed,
            OperationStatus::PDuplicated,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(60)), "0:01:00");
        assert_eq!(
            format_duration(chrono::Duration::milliseconds(3_723_500)),
            "1:02:03.500000"
        );
        assert_eq!(format_duration(chrono::Duration::seconds(-3)), "0:00:00");
    }

    #[test]
    fn test_rejected_is_terminal_failed() {
        let result = OperationResult::rejected("bad amount");
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("bad amount"));
        assert!(result.ended_at.is_some());
        assert!(!result.legacy_session_open);
    }

    #[test]
    fn test_result_serializes_decimals_as_numbers() {
        let mut result = OperationResult::pending(Local::now());
        result.line_items_sum = Some(Decimal::new(50005, 1));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], json!("PENDING"));
        assert_eq!(value["line_items_sum"], json!(5000.5));
        assert_eq!(value["operation_number"], json!(null));
        assert_eq!(value["similar_records_count"], json!(0));
    }
}
