//! Download task messaging: topology names, message bodies, and the broker
//! seam the producer and the worker pool talk through.

pub mod sqlite;

pub use sqlite::SqliteBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DOWNLOAD_EXCHANGE: &str = "download.exchange";
pub const RETRY_EXCHANGE: &str = "download.retry.exchange";
pub const DLQ_EXCHANGE: &str = "download.dlq.exchange";

pub const DOWNLOAD_QUEUE: &str = "download.queue";
pub const RETRY_QUEUE: &str = "download.retry.queue";
pub const DLQ_QUEUE: &str = "download.dlq.queue";

pub const DOWNLOAD_ROUTING_KEY: &str = "download";
pub const RETRY_ROUTING_KEY: &str = "download.retry";
pub const DLQ_ROUTING_KEY: &str = "download.dlq";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Body of messages on the main and retry queues.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub attempt: u32,
}

/// Body of messages on the dead-letter queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub task_id: Uuid,
    pub attempt: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// A claimed message. It stays invisible to other consumers until it is
/// acked, nacked, or its lease runs out.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: i64,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("exchange {0} is not declared")]
    UnknownExchange(String),

    #[error("no queue bound to {exchange} with routing key {routing_key}")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("delivery {0} is not held by this consumer")]
    UnknownDelivery(i64),

    #[error("message encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare exchanges, queues and bindings. Safe to call repeatedly.
    async fn declare_topology(&self) -> QueueResult<()>;

    /// Route `body` to every queue bound to `exchange` under `routing_key`.
    /// With an `expiration`, the message dead-letters out of its queue once
    /// it has waited that long.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        expiration: Option<Duration>,
    ) -> QueueResult<()>;

    /// Wait for the next message on `queue`. Returns `None` once `cancel`
    /// fires.
    async fn receive(
        &self,
        queue: &str,
        cancel: &CancellationToken,
    ) -> QueueResult<Option<Delivery>>;

    async fn ack(&self, tag: i64) -> QueueResult<()>;

    async fn nack(&self, tag: i64, requeue: bool) -> QueueResult<()>;

    async fn publish_task(&self, msg: &TaskMessage) -> QueueResult<()> {
        let body = serde_json::to_vec(msg)?;
        self.publish(DOWNLOAD_EXCHANGE, DOWNLOAD_ROUTING_KEY, body, None)
            .await
    }

    /// Park `msg` on the retry queue; it returns to the main queue after
    /// `delay`.
    async fn publish_retry(&self, msg: &TaskMessage, delay: Duration) -> QueueResult<()> {
        let body = serde_json::to_vec(msg)?;
        self.publish(RETRY_EXCHANGE, RETRY_ROUTING_KEY, body, Some(delay))
            .await
    }

    async fn publish_dlq(&self, record: &DeadLetterRecord) -> QueueResult<()> {
        let body = serde_json::to_vec(record)?;
        self.publish(DLQ_EXCHANGE, DLQ_ROUTING_KEY, body, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_bodies_use_camel_case() {
        let task_id = Uuid::nil();
        let json = serde_json::to_value(TaskMessage { task_id, attempt: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({ "taskId": task_id, "attempt": 2 }));

        let record = DeadLetterRecord {
            task_id,
            attempt: 5,
            error: "boom".into(),
            failed_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("failedAt").is_some());
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn malformed_delivery_fails_to_decode() {
        let delivery = Delivery {
            tag: 1,
            body: b"not json".to_vec(),
            redelivered: false,
        };
        assert!(matches!(
            delivery.decode::<TaskMessage>(),
            Err(QueueError::Codec(_))
        ));
    }
}
