//! Scripted legacy driver for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    DriverError, DuplicateFilter, FieldInput, LegacyDriver, OperationCategory, QueryOutcome,
    RecordHeader, Result, SessionHandle,
};

/// A call observed by the mock, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    OpenSession(OperationCategory),
    EnterHeader(RecordHeader),
    BeginLine,
    EnterField(FieldInput),
    CommitLine,
    ReadTotal,
    Validate,
    PrintDocument,
    QueryDuplicates(DuplicateFilter),
    CleanupError,
}

/// Steps the mock can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Open,
    Header,
    Field,
    Commit,
    ReadTotal,
    Validate,
    Print,
    Query,
    Cleanup,
}

/// Mock legacy driver for testing.
pub struct MockLegacyDriver {
    calls: Mutex<Vec<DriverCall>>,
    sessions_opened: AtomicUsize,
    session_available: bool,
    duplicates: QueryOutcome,
    total: String,
    operation_number: String,
    fail_on: Vec<FailPoint>,
    field_delay: Option<Duration>,
}

impl Default for MockLegacyDriver {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            sessions_opened: AtomicUsize::new(0),
            session_available: true,
            duplicates: QueryOutcome::Count(0),
            total: "0,00".to_string(),
            operation_number: "1".to_string(),
            fail_on: Vec::new(),
            field_delay: None,
        }
    }
}

impl MockLegacyDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `open_session` returns `Ok(None)`.
    pub fn without_session(mut self) -> Self {
        self.session_available = false;
        self
    }

    pub fn with_duplicates(mut self, outcome: QueryOutcome) -> Self {
        self.duplicates = outcome;
        self
    }

    pub fn with_total(mut self, total: impl Into<String>) -> Self {
        self.total = total.into();
        self
    }

    pub fn with_operation_number(mut self, number: impl Into<String>) -> Self {
        self.operation_number = number.into();
        self
    }

    pub fn failing_at(mut self, point: FailPoint) -> Self {
        self.fail_on.push(point);
        self
    }

    /// Sleep inside every field entry, to widen race windows in tests.
    pub fn with_field_delay(mut self, delay: Duration) -> Self {
        self.field_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Field entries, in order.
    pub fn fields(&self) -> Vec<FieldInput> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::EnterField(input) => Some(input.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &DriverCall) -> usize {
        self.lock().iter().filter(|call| *call == wanted).count()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DriverCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: DriverCall) {
        self.lock().push(call);
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if self.fail_on.contains(&point) {
            return Err(DriverError::ElementNotFound(format!("mock failure at {:?}", point)));
        }
        Ok(())
    }
}

#[async_trait]
impl LegacyDriver for MockLegacyDriver {
    async fn open_session(&self, category: OperationCategory) -> Result<Option<SessionHandle>> {
        self.record(DriverCall::OpenSession(category));
        if self.fail_on.contains(&FailPoint::Open) {
            return Err(DriverError::Transport("mock agent unreachable".to_string()));
        }
        if !self.session_available {
            return Ok(None);
        }
        let n = self.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(SessionHandle::new(format!("mock-{}", n))))
    }

    async fn enter_header(&self, _session: &SessionHandle, header: &RecordHeader) -> Result<()> {
        self.record(DriverCall::EnterHeader(header.clone()));
        self.check(FailPoint::Header)
    }

    async fn begin_line(&self, _session: &SessionHandle) -> Result<()> {
        self.record(DriverCall::BeginLine);
        Ok(())
    }

    async fn enter_field(&self, _session: &SessionHandle, input: FieldInput) -> Result<()> {
        self.record(DriverCall::EnterField(input));
        if let Some(delay) = self.field_delay {
            tokio::time::sleep(delay).await;
        }
        self.check(FailPoint::Field)
    }

    async fn commit_line(&self, _session: &SessionHandle) -> Result<()> {
        self.record(DriverCall::CommitLine);
        self.check(FailPoint::Commit)
    }

    async fn read_total(&self, _session: &SessionHandle) -> Result<String> {
        self.record(DriverCall::ReadTotal);
        self.check(FailPoint::ReadTotal)?;
        Ok(self.total.clone())
    }

    async fn validate(&self, _session: &SessionHandle) -> Result<String> {
        self.record(DriverCall::Validate);
        self.check(FailPoint::Validate)?;
        Ok(self.operation_number.clone())
    }

    async fn print_document(&self, _session: &SessionHandle) -> Result<()> {
        self.record(DriverCall::PrintDocument);
        self.check(FailPoint::Print)
    }

    async fn query_duplicates(&self, filter: &DuplicateFilter) -> Result<QueryOutcome> {
        self.record(DriverCall::QueryDuplicates(filter.clone()));
        self.check(FailPoint::Query)?;
        Ok(self.duplicates)
    }

    async fn cleanup_error(&self, _session: &SessionHandle) -> Result<()> {
        self.record(DriverCall::CleanupError);
        self.check(FailPoint::Cleanup)
    }
}
