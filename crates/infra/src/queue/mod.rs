//! Queue Abstraction: one named, durable queue per pipeline step.
//!
//! ## Semantics
//!
//! - **At-least-once**: `dequeue` leases a message for a visibility timeout.
//!   If the lease is neither acknowledged nor released before it expires, the
//!   message becomes visible again without any explicit call.
//! - **Bounded polling**: `dequeue` waits at most one poll interval and then
//!   returns `Ok(None)`.
//! - **Deduplicated enqueue**: message ids are derived from
//!   `(index, document_id, step)`. Enqueueing an id that is still pending
//!   (ready or leased) is a no-op, so re-dispatching a step is always safe.
//! - **Dead-lettering**: every dequeue bumps `delivery_count`. Once it exceeds
//!   `max_delivery_count` the queue moves the message to its dead-letter sink
//!   and that dequeue returns [`QueueError::DeadLettered`].
//!
//! ## Backends
//!
//! - [`InMemoryQueue`]: tests and single-process use (tokio clock)
//! - [`FileQueue`]: one JSON file per message, single host
//! - `RedisQueue` (feature `redis`): shared queue for distributed workers

pub mod file;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use docpipe_core::{DocumentId, IndexName, StepName};

pub use file::{FileQueue, FileQueueBackend};
pub use in_memory::{InMemoryQueue, InMemoryQueueBackend};
#[cfg(feature = "redis")]
pub use self::redis::{RedisQueue, RedisQueueBackend};

/// A request to run `step` for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub index: IndexName,
    pub document_id: DocumentId,
    pub step: StepName,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(index: IndexName, document_id: DocumentId, step: StepName) -> Self {
        Self {
            id: message_id(&index, &document_id, &step),
            index,
            document_id,
            step,
            enqueued_at: Utc::now(),
        }
    }
}

/// Deterministic message id. `+` never appears in identifiers, so ids cannot collide.
pub fn message_id(index: &IndexName, document_id: &DocumentId, step: &StepName) -> String {
    format!("{index}+{document_id}+{step}")
}

/// Proof of a lease on one delivery. Only the holder can acknowledge or requeue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt {
    message_id: String,
    token: Uuid,
}

impl Receipt {
    pub(crate) fn new(message_id: impl Into<String>, token: Uuid) -> Self {
        Self {
            message_id: message_id.into(),
            token,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub(crate) fn token(&self) -> Uuid {
        self.token
    }
}

/// A leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub receipt: Receipt,
    /// Number of times this message has been dequeued, this delivery included.
    pub delivery_count: u32,
}

/// Entry in a queue's dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: QueueMessage,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(message: QueueMessage, delivery_count: u32) -> Self {
        Self {
            message,
            delivery_count,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Whether an enqueue stored a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// A message with the same id was still pending; nothing changed.
    AlreadyPending,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The receipt is unknown, was superseded, or its lease expired.
    #[error("receipt not found for message {0}")]
    ReceiptNotFound(String),

    /// The dequeued message exceeded the delivery ceiling and was dead-lettered.
    #[error("message {} dead-lettered after {delivery_count} deliveries", message.id)]
    DeadLettered {
        message: Box<QueueMessage>,
        delivery_count: u32,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// Tunables shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Longest a `dequeue` call waits before returning `None`.
    #[serde(with = "crate::config::duration_ms")]
    pub poll_interval: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_delivery_count: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_delivery_count: 10,
        }
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Make `message` visible after `delay`.
    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the next visible message, waiting at most one poll interval.
    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Delete a leased message. Fails with `ReceiptNotFound` once the lease expired.
    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError>;

    /// Release a lease early; the message becomes visible again after `delay`.
    async fn requeue(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError>;

    /// Most recent dead-lettered messages, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;
}

/// Opens the queue that serves a given step.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn open(&self, step: &StepName) -> Result<Arc<dyn MessageQueue>, QueueError>;
}

#[async_trait]
impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<EnqueueOutcome, QueueError> {
        (**self).enqueue(message, delay).await
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).dequeue(visibility_timeout).await
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
        (**self).acknowledge(receipt).await
    }

    async fn requeue(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        (**self).requeue(receipt, delay).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        (**self).dead_letters(limit).await
    }
}
