//! HTTP bridge to the UI-automation agent.
//!
//! The agent runs next to the desktop application and owns the window
//! handles. Every call is a JSON POST; failures come back as
//! `{"kind": ..., "message": ...}` with a non-2xx status.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    DriverError, DuplicateFilter, FieldInput, LegacyDriver, OperationCategory, QueryOutcome,
    RecordHeader, Result, SessionHandle,
};

/// HTTP driver configuration.
#[derive(Debug, Clone)]
pub struct HttpDriverConfig {
    /// Agent base URL (e.g., http://127.0.0.1:8765).
    pub base_url: String,
    /// Per-request timeout. Printing can take several seconds.
    pub timeout: Duration,
}

impl Default for HttpDriverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8765".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl From<&crate::config::DriverConfig> for HttpDriverConfig {
    fn from(config: &crate::config::DriverConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            timeout: config.timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TotalBody {
    total: String,
}

#[derive(Debug, Deserialize)]
struct ValidateBody {
    operation_number: String,
}

#[derive(Debug, Deserialize)]
struct DuplicatesBody {
    count: Option<u32>,
    #[serde(default)]
    exists: bool,
}

#[derive(Debug, Deserialize)]
struct Empty {}

/// Production driver speaking JSON to the automation agent.
pub struct HttpLegacyDriver {
    client: Client,
    base_url: String,
}

impl HttpLegacyDriver {
    pub fn new(config: HttpDriverConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DriverError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn session_url(&self, session: &SessionHandle, action: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, session.id, action)
    }

    async fn post<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        debug!(url = %url, "Driver request");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| DriverError::Protocol(format!("{}: {}", url, e)));
        }

        let body = response.json::<ErrorBody>().await.unwrap_or(ErrorBody {
            kind: String::new(),
            message: status.to_string(),
        });
        Err(Self::map_error(status, body))
    }

    fn map_error(status: StatusCode, body: ErrorBody) -> DriverError {
        match body.kind.as_str() {
            "window_not_found" => DriverError::WindowNotFound(body.message),
            "element_not_found" => DriverError::ElementNotFound(body.message),
            _ if status == StatusCode::NOT_FOUND => DriverError::ElementNotFound(body.message),
            _ => DriverError::Protocol(format!("{}: {}", status, body.message)),
        }
    }
}

#[async_trait]
impl LegacyDriver for HttpLegacyDriver {
    async fn open_session(&self, category: OperationCategory) -> Result<Option<SessionHandle>> {
        let url = format!("{}/sessions", self.base_url);
        match self
            .post::<_, SessionBody>(&url, &json!({ "category": category }))
            .await
        {
            Ok(body) => Ok(Some(SessionHandle::new(body.session_id))),
            Err(DriverError::WindowNotFound(reason)) => {
                debug!(reason = %reason, "Legacy window not available");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn enter_header(&self, session: &SessionHandle, header: &RecordHeader) -> Result<()> {
        self.post::<_, Empty>(&self.session_url(session, "header"), header)
            .await
            .map(|_| ())
    }

    async fn begin_line(&self, session: &SessionHandle) -> Result<()> {
        self.post::<_, Empty>(&self.session_url(session, "lines"), &json!({}))
            .await
            .map(|_| ())
    }

    async fn enter_field(&self, session: &SessionHandle, input: FieldInput) -> Result<()> {
        self.post::<_, Empty>(&self.session_url(session, "fields"), &input)
            .await
            .map(|_| ())
    }

    async fn commit_line(&self, session: &SessionHandle) -> Result<()> {
        self.post::<_, Empty>(&self.session_url(session, "lines/commit"), &json!({}))
            .await
            .map(|_| ())
    }

    async fn read_total(&self, session: &SessionHandle) -> Result<String> {
        self.post::<_, TotalBody>(&self.session_url(session, "total"), &json!({}))
            .await
            .map(|body| body.total)
    }

    async fn validate(&self, session: &SessionHandle) -> Result<String> {
        self.post::<_, ValidateBody>(&self.session_url(session, "validate"), &json!({}))
            .await
            .map(|body| body.operation_number)
    }

    async fn print_document(&self, session: &SessionHandle) -> Result<()> {
        self.post::<_, Empty>(&self.session_url(session, "print"), &json!({}))
            .await
            .map(|_| ())
    }

    async fn query_duplicates(&self, filter: &DuplicateFilter) -> Result<QueryOutcome> {
        let url = format!("{}/queries/duplicates", self.base_url);
        let body = self.post::<_, DuplicatesBody>(&url, filter).await?;
        Ok(match body.count {
            Some(count) => QueryOutcome::Count(count),
            None if body.exists => QueryOutcome::Exists,
            None => QueryOutcome::Count(0),
        })
    }

    async fn cleanup_error(&self, session: &SessionHandle) -> Result<()> {
        self.post::<_, Empty>(&self.session_url(session, "cleanup"), &json!({}))
            .await
            .map(|_| ())
    }
}
