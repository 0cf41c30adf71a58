//! Operation state machine.
//!
//! ```text
//! PENDING --dup check--> P_DUPLICATED | FAILED
//!    |
//!    +--open session--> FAILED
//!    |
//! IN_PROGRESS --fill--> FAILED
//!    |
//! COMPLETED (draft) --validate--> FAILED
//!    |                     |
//!    |                  --print--> INCOMPLETED
//!    v                     v
//! COMPLETED            COMPLETED
//! ```
//!
//! The legacy session is exclusive: one operation holds the session lock
//! from the duplicate query until cleanup has run. Every path that leaves a
//! session open in a bad state (fill/validate/print failure, panic) runs the
//! driver's cleanup before the lock is released.

use std::sync::Arc;

use chrono::Local;
use futures::FutureExt;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::driver::{FieldInput, LegacyDriver, OperationCategory, RecordHeader, SessionHandle};
use crate::duplicates::{DuplicateDetector, DuplicateOutcome};
use crate::model::{
    parse_amount, InvalidAmount, LinkedReference, Nature, OperationRecord, OperationResult,
    OperationStatus, TotalError,
};
use crate::observer::{EventKind, Notifier, ObserverEvent};

/// Amount read back from the legacy form after filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillSummary {
    pub line_items_sum: Decimal,
    pub operation_total: Decimal,
    pub entered: usize,
}

/// Drives one operation at a time through the legacy application.
pub struct Orchestrator {
    driver: Arc<dyn LegacyDriver>,
    detector: DuplicateDetector,
    session_lock: Arc<Mutex<()>>,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(driver: Arc<dyn LegacyDriver>, notifier: Notifier) -> Self {
        Self {
            detector: DuplicateDetector::new(Arc::clone(&driver)),
            driver,
            session_lock: Arc::new(Mutex::new(())),
            notifier,
        }
    }

    /// Share the session lock with other orchestrators driving the same
    /// application instance.
    pub fn with_session_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.session_lock = lock;
        self
    }

    pub fn session_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.session_lock)
    }

    /// Run one operation to a terminal state. Never fails: every error is
    /// folded into the returned result.
    #[tracing::instrument(name = "operation", skip_all, fields(task_id = %task_id))]
    pub async fn run(&self, task_id: &str, record: &OperationRecord) -> OperationResult {
        let mut result = OperationResult::pending(Local::now());
        let mut session: Option<SessionHandle> = None;

        let _guard = self.session_lock.lock().await;

        let outcome = std::panic::AssertUnwindSafe(self.drive(
            task_id,
            record,
            &mut result,
            &mut session,
        ))
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(message)) => result.fail(message),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(error = %message, "Operation panicked");
                result.fail(format!("Unexpected error: {}", message));
            }
        }

        let needs_cleanup = matches!(
            result.status,
            OperationStatus::Failed | OperationStatus::Incompleted
        );
        if needs_cleanup && result.legacy_session_open {
            if let Some(session) = &session {
                self.cleanup(task_id, session).await;
            }
        }

        result.finish(Local::now());

        info!(
            status = %result.status,
            duration = result.duration.as_deref().unwrap_or_default(),
            operation_number = result.operation_number.as_deref().unwrap_or_default(),
            error = result.error.as_deref().unwrap_or_default(),
            "Operation finished"
        );

        result
    }

    /// The happy path. `Err` means "abort as FAILED with this message".
    async fn drive(
        &self,
        task_id: &str,
        record: &OperationRecord,
        result: &mut OperationResult,
        session: &mut Option<SessionHandle>,
    ) -> Result<(), String> {
        if record.finalize_intent {
            self.notifier.step(task_id, "checking duplicates");
            match self.detector.check(record).await {
                DuplicateOutcome::NoneFound => {}
                DuplicateOutcome::Found(count) => {
                    result.status = OperationStatus::PDuplicated;
                    result.similar_records_count = count;
                    result.error = Some(format!(
                        "{} similar record(s) already registered for this operation",
                        count
                    ));
                    return Ok(());
                }
                DuplicateOutcome::Error(reason) => return Err(reason),
            }
        }

        self.notifier.step(task_id, "opening session");
        let handle = match self.driver.open_session(OperationCategory::Reconciliation).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return Err("session open failed".to_string()),
            Err(e) => return Err(format!("session open failed: {}", e)),
        };
        let handle = session.insert(handle);
        result.legacy_session_open = true;
        result.status = OperationStatus::InProgress;

        let summary = self
            .fill(task_id, handle, record)
            .await
            .map_err(|e| e.to_string())?;
        result.line_items_sum = Some(summary.line_items_sum);
        result.operation_total = Some(summary.operation_total);
        result.status = OperationStatus::Completed;

        if !record.finalize_intent {
            info!("Left as draft, not validated");
            return Ok(());
        }

        self.notifier.step(task_id, "validating");
        let number = self
            .driver
            .validate(handle)
            .await
            .map_err(|e| format!("Validation error: {}", e))?;
        result.operation_number = Some(number);

        self.notifier.step(task_id, "printing");
        if let Err(e) = self.driver.print_document(handle).await {
            warn!(error = %e, "Document did not print");
            result.status = OperationStatus::Incompleted;
            result.error = Some(format!("Print document error: {}", e));
        }

        Ok(())
    }

    /// Type the header and line items, then read back the displayed total.
    async fn fill(
        &self,
        task_id: &str,
        session: &SessionHandle,
        record: &OperationRecord,
    ) -> Result<FillSummary, Box<dyn std::error::Error + Send + Sync>> {
        self.notifier.step(task_id, "filling header");
        self.driver
            .enter_header(session, &header_of(record))
            .await?;

        let (sum, entered) = match &record.nature {
            Nature::Other(raw) => {
                warn!(nature = %raw, "Unrecognized nature, no line items entered");
                (Decimal::ZERO, 0)
            }
            _ => self.enter_line_items(task_id, session, record).await?,
        };

        self.notifier.step(task_id, "reading total");
        let displayed = self.driver.read_total(session).await?;
        let operation_total = parse_displayed_total(&displayed)?;

        info!(
            entered = entered,
            line_items_sum = %sum,
            operation_total = %operation_total,
            "Form filled"
        );

        Ok(FillSummary {
            line_items_sum: sum,
            operation_total,
            entered,
        })
    }

    /// Enter every strictly positive line item. Expense entries stop after
    /// the first one.
    async fn enter_line_items(
        &self,
        task_id: &str,
        session: &SessionHandle,
        record: &OperationRecord,
    ) -> Result<(Decimal, usize), Box<dyn std::error::Error + Send + Sync>> {
        let mut sum = Decimal::ZERO;
        let mut entered = 0usize;

        for (index, item) in record.line_items.iter().enumerate() {
            let amount = item.amount_value()?;
            if amount <= Decimal::ZERO {
                continue;
            }

            self.notifier.emit(
                ObserverEvent::new(EventKind::Step)
                    .with("task_id", task_id)
                    .with("step", "line item")
                    .with("current_line_item", (index + 1) as u64)
                    .with("line_item_details", format!("{} {}", item.code, item.amount)),
            );

            self.driver.begin_line(session).await?;
            self.driver
                .enter_field(session, FieldInput::Code(item.code.clone()))
                .await?;

            if record.nature == Nature::Expense {
                if !item.linked_reference.is_set() {
                    self.driver
                        .enter_field(session, FieldInput::SkipLinkedReference)
                        .await?;
                }
                self.driver
                    .enter_field(session, FieldInput::Amount(item.amount.clone()))
                    .await?;
            } else {
                let reference = match item.linked_reference {
                    LinkedReference::Flag(true) => FieldInput::NewLinkedReference,
                    LinkedReference::Reference(id) if id != 0 => {
                        FieldInput::ExistingLinkedReference(id)
                    }
                    _ => FieldInput::SkipLinkedReference,
                };
                self.driver.enter_field(session, reference).await?;
                self.driver
                    .enter_field(session, FieldInput::Amount(item.amount.clone()))
                    .await?;
                self.driver
                    .enter_field(session, FieldInput::LedgerCode(item.ledger_code.clone()))
                    .await?;
            }

            self.driver.commit_line(session).await?;
            sum = sum.checked_add(amount).ok_or(TotalError::Overflow)?;
            entered += 1;

            // Expense entries carry a single line.
            if record.nature == Nature::Expense {
                break;
            }
        }

        Ok((sum, entered))
    }

    async fn cleanup(&self, task_id: &str, session: &SessionHandle) {
        self.notifier.step(task_id, "cleaning up");
        let outcome = std::panic::AssertUnwindSafe(self.driver.cleanup_error(session))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Cleanup failed"),
            Err(_) => warn!("Cleanup panicked"),
        }
    }
}

fn header_of(record: &OperationRecord) -> RecordHeader {
    RecordHeader {
        date: record.date.clone(),
        cash_register_id: record.cash_register_id.clone(),
        file_reference: record.file_reference.clone(),
        third_party_id: record.third_party_id.clone(),
        nature: record.nature.clone(),
        description: record.description.clone(),
    }
}

/// The form may show thousands separators ("5.000,00").
fn parse_displayed_total(displayed: &str) -> Result<Decimal, InvalidAmount> {
    if displayed.contains(',') {
        parse_amount(&displayed.replace('.', ""))
    } else {
        parse_amount(displayed)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
