//! Duplicate detection for operations about to be finalized.
//!
//! Runs strictly before anything is written to the legacy application and
//! only issues a read-only query.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::driver::{DuplicateFilter, LegacyDriver, OperationCategory, QueryOutcome};
use crate::model::{format_amount, OperationRecord};

/// Classification of the duplicate query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateOutcome {
    NoneFound,
    Found(u32),
    Error(String),
}

impl fmt::Display for DuplicateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateOutcome::NoneFound => f.write_str("none found"),
            DuplicateOutcome::Found(n) => write!(f, "{} found", n),
            DuplicateOutcome::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Queries the legacy application for prior records matching third party,
/// date, cash register and exact total.
pub struct DuplicateDetector {
    driver: Arc<dyn LegacyDriver>,
}

impl DuplicateDetector {
    pub fn new(driver: Arc<dyn LegacyDriver>) -> Self {
        Self { driver }
    }

    pub async fn check(&self, record: &OperationRecord) -> DuplicateOutcome {
        let total = match record.expected_total() {
            Ok(total) => total,
            Err(e) => return DuplicateOutcome::Error(format!("Validation error: {}", e)),
        };

        if total.is_zero() {
            return DuplicateOutcome::Error("no monetary content to reconcile".to_string());
        }

        let filter = build_filter(record, total);

        let outcome = match self.driver.query_duplicates(&filter).await {
            Ok(QueryOutcome::Count(0)) => DuplicateOutcome::NoneFound,
            Ok(QueryOutcome::Count(n)) => DuplicateOutcome::Found(n),
            Ok(QueryOutcome::Exists) => DuplicateOutcome::Found(1),
            Err(e) => DuplicateOutcome::Error(format!("Duplicate query failed: {}", e)),
        };

        match &outcome {
            DuplicateOutcome::Error(reason) => {
                warn!(third_party = %filter.third_party_id, reason = %reason, "Duplicate check failed")
            }
            _ => info!(
                third_party = %filter.third_party_id,
                date = %filter.date_from,
                cash_register = %filter.cash_register_id,
                amount = %filter.amount_from,
                outcome = %outcome,
                "Duplicate check"
            ),
        }

        outcome
    }
}

/// Single-day, exact-amount filter for a record.
pub fn build_filter(record: &OperationRecord, total: Decimal) -> DuplicateFilter {
    let amount = format_amount(total);
    DuplicateFilter {
        category: OperationCategory::Reconciliation,
        third_party_id: record.third_party_id.clone(),
        date_from: record.date.clone(),
        date_to: record.date.clone(),
        cash_register_id: record.cash_register_id.clone(),
        amount_from: amount.clone(),
        amount_to: amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{DriverCall, FailPoint, MockLegacyDriver};
    use crate::transform::transform;
    use serde_json::json;

    fn record(amounts: serde_json::Value) -> OperationRecord {
        let items: Vec<_> = amounts
            .as_array()
            .unwrap()
            .iter()
            .map(|a| json!({"economica": "30012", "importe": a}))
            .collect();
        transform(&json!({
            "fecha": "08112024",
            "caja": "204",
            "tercero": "43000000M",
            "naturaleza": "5",
            "texto_sical": [{"tcargo": "COBRO /F"}],
            "aplicaciones": items,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_none_found() {
        let driver = Arc::new(MockLegacyDriver::new());
        let detector = DuplicateDetector::new(driver.clone());

        let outcome = detector.check(&record(json!([100.5, 0.0, 20]))).await;

        assert_eq!(outcome, DuplicateOutcome::NoneFound);
        let calls = driver.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            DriverCall::QueryDuplicates(filter) => {
                assert_eq!(filter.amount_from, "120,5");
                assert_eq!(filter.amount_from, filter.amount_to);
                assert_eq!(filter.date_from, "08112024");
                assert_eq!(filter.date_from, filter.date_to);
                assert_eq!(filter.third_party_id, "43000000M");
                assert_eq!(filter.cash_register_id, "204");
                assert_eq!(filter.category, OperationCategory::Reconciliation);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_found_with_count() {
        let driver = Arc::new(MockLegacyDriver::new().with_duplicates(QueryOutcome::Count(3)));
        let outcome = DuplicateDetector::new(driver).check(&record(json!([5000.0]))).await;
        assert_eq!(outcome, DuplicateOutcome::Found(3));
    }

    #[tokio::test]
    async fn test_existence_without_count_is_one() {
        let driver = Arc::new(MockLegacyDriver::new().with_duplicates(QueryOutcome::Exists));
        let outcome = DuplicateDetector::new(driver).check(&record(json!([5000.0]))).await;
        assert_eq!(outcome, DuplicateOutcome::Found(1));
    }

    #[tokio::test]
    async fn test_zero_total_errors_without_querying() {
        let driver = Arc::new(MockLegacyDriver::new());
        let detector = DuplicateDetector::new(driver.clone());

        let outcome = detector.check(&record(json!([0.0, 0]))).await;

        assert_eq!(
            outcome,
            DuplicateOutcome::Error("no monetary content to reconcile".to_string())
        );
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_query_failure_is_error() {
        let driver = Arc::new(MockLegacyDriver::new().failing_at(FailPoint::Query));
        let outcome = DuplicateDetector::new(driver).check(&record(json!([10]))).await;
        assert!(matches!(outcome, DuplicateOutcome::Error(reason) if reason.contains("mock failure")));
    }

    #[tokio::test]
    async fn test_check_only_queries() {
        let driver = Arc::new(MockLegacyDriver::new().with_duplicates(QueryOutcome::Count(2)));
        DuplicateDetector::new(driver.clone())
            .check(&record(json!([10])))
            .await;
        assert!(driver
            .calls()
            .iter()
            .all(|call| matches!(call, DriverCall::QueryDuplicates(_))));
        assert_eq!(driver.sessions_opened(), 0);
    }
}
