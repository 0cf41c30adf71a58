//! Mock result publisher for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, ResultMessage, ResultPublisher, Result};

/// A message captured by the mock, with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedResult {
    pub correlation_id: Option<String>,
    pub message: ResultMessage,
}

/// Mock result publisher for testing.
#[derive(Default)]
pub struct MockResultPublisher {
    published: RwLock<Vec<PublishedResult>>,
    fail_on_publish: RwLock<bool>,
}

impl MockResultPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<PublishedResult> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl ResultPublisher for MockResultPublisher {
    async fn publish(&self, correlation_id: Option<&str>, message: &ResultMessage) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.published.write().await.push(PublishedResult {
            correlation_id: correlation_id.map(str::to_string),
            message: message.clone(),
        });
        Ok(())
    }
}
