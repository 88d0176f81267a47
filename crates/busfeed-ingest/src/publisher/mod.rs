//! Publishing to the partitioned log
//!
//! The [`Publisher`] trait is the only way the ingestion driver talks to the log
//! service. It is a single-owner, cooperative contract:
//!
//! - [`Publisher::enqueue`] never blocks; a full buffer is reported as
//!   [`EnqueueError::QueueFull`] and the request is handed back.
//! - [`Publisher::pump`] serves every delivery report that has already arrived.
//! - [`Publisher::drain`] waits, up to a timeout, until nothing is outstanding.
//!
//! Every accepted request produces exactly one [`DeliveryReport`], handed to the
//! caller's [`DeliveryHandler`] from `pump` or `drain`. Reports can arrive in any
//! order relative to submission.
//!
//! Implementations:
//! - [`BufferedPublisher`]: in-process producer engine over any [`LogTransport`]
//! - [`MemoryLog`]: an in-process partitioned log transport
//! - `KafkaPublisher` (feature `kafka`): librdkafka through `rdkafka`

pub mod config;
pub mod engine;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod transport;

pub use config::{Acks, CompressionType, ConfigError, PublisherConfig};
pub use engine::BufferedPublisher;
#[cfg(feature = "kafka")]
pub use kafka::KafkaPublisher;
pub use memory::{Fault, MemoryLog, StoredRecord};
pub use transport::{LogTransport, TransportError, TransportErrorKind};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// One message handed to a publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    /// Partition key; messages sharing a key land in the same partition
    pub key: String,
    pub payload: Vec<u8>,
    /// Opaque correlation token echoed back in the delivery report
    pub token: u64,
}

impl PublishRequest {
    /// Bytes this request holds in the local buffer
    pub fn size(&self) -> usize {
        self.key.len() + self.payload.len()
    }
}

/// Terminal result of one accepted request
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Persisted by the log; `offset` is -1 when the ack level does not return one
    Acknowledged {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Failed(DeliveryError),
}

impl DeliveryOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, DeliveryOutcome::Acknowledged { .. })
    }
}

/// Why an accepted request was not delivered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("message timed out before acknowledgment")]
    Timeout,

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("rejected by log service: {0}")]
    Rejected(String),

    #[error("producer failure: {0}")]
    Fatal(String),
}

impl DeliveryError {
    /// Short label used for counters and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Timeout => "timeout",
            DeliveryError::RetriesExhausted { .. } => "retries_exhausted",
            DeliveryError::Rejected(_) => "rejected",
            DeliveryError::Fatal(_) => "fatal",
        }
    }
}

/// Delivery callback payload
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub token: u64,
    pub key: String,
    pub outcome: DeliveryOutcome,
    /// Transmission attempts made (0 if the message never left the buffer)
    pub attempts: u32,
    /// Time from enqueue to outcome
    pub latency: Duration,
}

/// Synchronous enqueue failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// Local buffer at capacity; pump and try again
    #[error("local queue full ({capacity} messages)")]
    QueueFull { capacity: usize },

    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid topic name '{0}'")]
    InvalidTopic(String),

    #[error("publisher is closed")]
    Closed,
}

impl EnqueueError {
    /// Only a full queue is worth retrying after a pump
    pub fn is_backpressure(&self) -> bool {
        matches!(self, EnqueueError::QueueFull { .. })
    }
}

/// A rejected enqueue, returning ownership of the request
#[derive(Debug, Error)]
#[error("{error}")]
pub struct EnqueueRejected {
    #[source]
    pub error: EnqueueError,
    pub request: PublishRequest,
}

/// Receives delivery reports from [`Publisher::pump`] and [`Publisher::drain`]
pub trait DeliveryHandler: Send {
    fn on_delivery(&mut self, report: DeliveryReport);
}

impl DeliveryHandler for Vec<DeliveryReport> {
    fn on_delivery(&mut self, report: DeliveryReport) {
        self.push(report);
    }
}

/// Flow-controlled handoff of messages to the log service
#[async_trait]
pub trait Publisher: Send {
    /// Buffer a request for asynchronous transmission without waiting.
    fn enqueue(&mut self, request: PublishRequest) -> Result<(), EnqueueRejected>;

    /// Serve every delivery report already available; returns how many were served.
    fn pump(&mut self, handler: &mut dyn DeliveryHandler) -> usize;

    /// Transmit everything buffered and serve reports until nothing is
    /// outstanding or `timeout` elapses. Returns the number still unresolved.
    async fn drain(&mut self, timeout: Duration, handler: &mut dyn DeliveryHandler) -> usize;

    /// Accepted requests without a served report
    fn outstanding(&self) -> usize;
}

/// Validation shared by every publisher implementation
pub(crate) fn validate_request(
    request: &PublishRequest,
    max_message_bytes: usize,
) -> Result<(), EnqueueError> {
    let topic = request.topic.as_str();
    let valid_topic = !topic.is_empty()
        && topic.len() <= 249
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid_topic {
        return Err(EnqueueError::InvalidTopic(request.topic.clone()));
    }

    let size = request.size();
    if size > max_message_bytes {
        return Err(EnqueueError::MessageTooLarge {
            size,
            max: max_message_bytes,
        });
    }

    Ok(())
}
