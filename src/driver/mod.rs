//! Legacy application driver.
//!
//! The desktop accounting application is driven through a capability
//! interface. The core never knows how a field is located on screen; it only
//! asks for sessions, field entries, and read-backs.
//!
//! Implementations:
//! - `HttpLegacyDriver`: JSON bridge to the local UI-automation agent
//! - `MockLegacyDriver`: scripted in-memory double for testing

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Nature;

pub mod http;
pub mod mock;

pub use http::HttpLegacyDriver;
pub use mock::{DriverCall, FailPoint, MockLegacyDriver};

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors raised by the legacy application driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Window not found: {0}")]
    WindowNotFound(String),

    #[error("UI element not found: {0}")]
    ElementNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),
}

/// Working context category opened in the legacy application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    /// Treasury > collections > reconciliation, individual entry.
    Reconciliation,
}

/// Handle to an open working context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Header fields typed before any line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    #[serde(rename = "fecha")]
    pub date: String,
    #[serde(rename = "caja")]
    pub cash_register_id: String,
    #[serde(rename = "expediente")]
    pub file_reference: String,
    #[serde(rename = "tercero")]
    pub third_party_id: String,
    #[serde(rename = "naturaleza")]
    pub nature: Nature,
    #[serde(rename = "resumen")]
    pub description: Option<String>,
}

/// One keyed entry inside an open line-item row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldInput {
    /// Budget line code.
    Code(String),
    /// Move past the linked-reference sub-field without typing.
    SkipLinkedReference,
    /// Ask the application to create a new linked reference.
    NewLinkedReference,
    /// Type an existing linked reference.
    ExistingLinkedReference(i64),
    /// Comma-decimal amount.
    Amount(String),
    LedgerCode(String),
}

/// Filter for the duplicate query. Amount bounds use the same
/// comma-formatted string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateFilter {
    pub category: OperationCategory,
    pub third_party_id: String,
    pub date_from: String,
    pub date_to: String,
    pub cash_register_id: String,
    pub amount_from: String,
    pub amount_to: String,
}

/// What the duplicate query reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Matches with a known count (possibly zero).
    Count(u32),
    /// At least one match, count unavailable.
    Exists,
}

/// Capability interface over the legacy application.
///
/// A session is exclusive process-wide state; callers serialize access.
#[async_trait]
pub trait LegacyDriver: Send + Sync {
    /// Open the working context. `Ok(None)` when the window could not be
    /// reached.
    async fn open_session(&self, category: OperationCategory) -> Result<Option<SessionHandle>>;

    /// Reset the form and type the header fields.
    async fn enter_header(&self, session: &SessionHandle, header: &RecordHeader) -> Result<()>;

    /// Open a new line-item row.
    async fn begin_line(&self, session: &SessionHandle) -> Result<()>;

    async fn enter_field(&self, session: &SessionHandle, input: FieldInput) -> Result<()>;

    /// Confirm the current row.
    async fn commit_line(&self, session: &SessionHandle) -> Result<()>;

    /// Read the total the application displays, comma-decimal.
    async fn read_total(&self, session: &SessionHandle) -> Result<String>;

    /// Confirm the entry and return the assigned operation number.
    async fn validate(&self, session: &SessionHandle) -> Result<String>;

    async fn print_document(&self, session: &SessionHandle) -> Result<()>;

    /// Read-only query for prior records. Must not create or modify anything.
    async fn query_duplicates(&self, filter: &DuplicateFilter) -> Result<QueryOutcome>;

    /// Dismiss leftover dialogs after a failure. Best-effort.
    async fn cleanup_error(&self, session: &SessionHandle) -> Result<()>;
}
