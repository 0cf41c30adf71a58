//! Message transport.
//!
//! This module contains:
//! - Inbound envelope parsing (`TaskEnvelope`)
//! - The outbound result message (`ResultMessage`)
//! - `ResultPublisher` trait: places results on the fixed results destination
//! - Implementations: AMQP (RabbitMQ), Mock

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{OperationResult, OperationStatus};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpConsumer, AmqpResultPublisher};
pub use mock::{MockResultPublisher, PublishedResult};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Malformed message: {0}")]
    Parse(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// What to tell the broker once a delivery has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed, possibly with an unfavorable outcome.
    Ack,
    /// Parse or transport failure; redeliver.
    Requeue,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    pub task_id: Option<String>,
    /// Operation type tag, when the current envelope shape is used.
    pub kind: Option<String>,
    /// The raw operation payload handed to the transformer.
    pub payload: Value,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    task_id: Option<Value>,
    operation_data: RawOperationData,
}

#[derive(Deserialize)]
struct RawOperationData {
    operation: Value,
}

impl TaskEnvelope {
    /// Decode a message body.
    ///
    /// Accepts `operation_data.operation = {tipo, detalle}` as well as the
    /// older shape where `operation_data.operation` is the payload itself.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let raw: RawEnvelope =
            serde_json::from_slice(body).map_err(|e| BusError::Parse(e.to_string()))?;

        let task_id = match raw.task_id {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };

        let operation = raw.operation_data.operation;
        let (kind, payload) = match operation {
            Value::Object(mut map) if map.contains_key("detalle") => {
                let kind = map.get("tipo").and_then(Value::as_str).map(str::to_string);
                let payload = map.remove("detalle").unwrap_or(Value::Null);
                (kind, payload)
            }
            other => (None, other),
        };

        if !payload.is_object() {
            return Err(BusError::Parse("operation payload is not an object".to_string()));
        }

        Ok(Self {
            task_id,
            kind,
            payload,
        })
    }
}

/// The message published for every processed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub status: OperationStatus,
    pub operation_id: Option<String>,
    pub result: OperationResult,
}

impl ResultMessage {
    pub fn new(operation_id: Option<String>, result: OperationResult) -> Self {
        Self {
            status: result.status,
            operation_id,
            result,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::Publish(e.to_string()))
    }
}

/// Places results on the single fixed results destination.
///
/// Implementations:
/// - `AmqpResultPublisher`: RabbitMQ default exchange
/// - `MockResultPublisher`: In-memory mock for testing
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    /// Publish one result, tagged with the inbound correlation id.
    async fn publish(&self, correlation_id: Option<&str>, message: &ResultMessage) -> Result<()>;
}

#[cfg(test)]
mod tests;
