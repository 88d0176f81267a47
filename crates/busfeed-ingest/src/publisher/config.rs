//! Publisher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Publisher Defaults
// ============================================================================

pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";
pub const DEFAULT_CLIENT_ID: &str = "busfeed-ingest";
pub const DEFAULT_MAX_IN_FLIGHT: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
pub const DEFAULT_LINGER_MS: u64 = 2;
pub const DEFAULT_BATCH_SIZE_BYTES: usize = 32 * 1024;
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_QUEUE_MAX_MESSAGES: usize = 100_000;
pub const DEFAULT_QUEUE_MAX_BYTES: usize = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Upper bound on in-flight requests that keeps per-partition order under retry
/// when idempotence is enabled.
pub const IDEMPOTENT_MAX_IN_FLIGHT: usize = 5;

/// How many replicas must persist a batch before it is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget; no offset is returned
    None,
    /// Partition leader only
    Leader,
    /// Every in-sync replica
    #[default]
    All,
}

impl Acks {
    /// librdkafka `acks` value
    pub fn as_kafka_str(self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

impl std::str::FromStr for Acks {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "0" => Ok(Acks::None),
            "leader" | "1" => Ok(Acks::Leader),
            "all" | "-1" => Ok(Acks::All),
            _ => Err(ConfigError::Invalid(format!("unknown acks level '{}'", s))),
        }
    }
}

/// Batch compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    #[default]
    Zstd,
}

impl CompressionType {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for CompressionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "zstd" => Ok(CompressionType::Zstd),
            _ => Err(ConfigError::Invalid(format!("unknown compression codec '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid publisher configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for busfeed_common::BusfeedError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid(reason) => Self::Config(reason),
        }
    }
}

/// Producer settings, fixed for the lifetime of a publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Log service address list (host:port, comma separated)
    pub bootstrap_servers: String,
    pub client_id: String,
    pub acks: Acks,

    /// No duplicate persisted message per logical send, even under retry
    pub idempotent: bool,

    /// Concurrent unacknowledged requests per connection
    pub max_in_flight: usize,

    /// Transparent resends of a batch before it is reported failed
    pub max_retries: u32,
    pub retry_backoff: Duration,

    /// How long a partially filled batch may wait for more messages
    pub linger: Duration,
    pub batch_size_bytes: usize,
    pub compression: CompressionType,

    /// Per-message deadline from enqueue to acknowledgment
    pub message_timeout: Duration,
    /// Overall delivery deadline per message, retries included
    pub delivery_timeout: Duration,

    /// Local buffer capacity; `enqueue` rejects beyond either limit
    pub queue_max_messages: usize,
    pub queue_max_bytes: usize,

    /// Largest key + payload accepted by `enqueue`
    pub max_message_bytes: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: DEFAULT_BOOTSTRAP_SERVERS.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            acks: Acks::All,
            idempotent: true,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            linger: Duration::from_millis(DEFAULT_LINGER_MS),
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            compression: CompressionType::Zstd,
            message_timeout: Duration::from_millis(DEFAULT_MESSAGE_TIMEOUT_MS),
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            queue_max_messages: DEFAULT_QUEUE_MAX_MESSAGES,
            queue_max_bytes: DEFAULT_QUEUE_MAX_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl PublisherConfig {
    /// Effective per-message deadline
    pub fn message_deadline(&self) -> Duration {
        self.message_timeout.min(self.delivery_timeout)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.bootstrap_servers.trim().is_empty() {
            return invalid("bootstrap_servers cannot be empty".into());
        }
        if self.max_in_flight == 0 {
            return invalid("max_in_flight must be greater than 0".into());
        }
        if self.batch_size_bytes == 0 {
            return invalid("batch_size_bytes must be greater than 0".into());
        }
        if self.queue_max_messages == 0 || self.queue_max_bytes == 0 {
            return invalid("queue limits must be greater than 0".into());
        }
        if self.max_message_bytes > self.queue_max_bytes {
            return invalid(format!(
                "max_message_bytes ({}) cannot exceed queue_max_bytes ({})",
                self.max_message_bytes, self.queue_max_bytes
            ));
        }
        if self.message_deadline().is_zero() {
            return invalid("message and delivery timeouts must be greater than 0".into());
        }

        if self.idempotent {
            if self.acks != Acks::All {
                return invalid("idempotence requires acks=all".into());
            }
            if self.max_in_flight > IDEMPOTENT_MAX_IN_FLIGHT {
                return invalid(format!(
                    "idempotence requires max_in_flight <= {} (got {})",
                    IDEMPOTENT_MAX_IN_FLIGHT, self.max_in_flight
                ));
            }
            if self.max_retries == 0 {
                return invalid("idempotence requires max_retries > 0".into());
            }
        }

        Ok(())
    }

    /// librdkafka property names and values for this configuration
    pub fn kafka_properties(&self) -> Vec<(&'static str, String)> {
        let ms = |d: Duration| d.as_millis().to_string();
        vec![
            ("bootstrap.servers", self.bootstrap_servers.clone()),
            ("client.id", self.client_id.clone()),
            ("acks", self.acks.as_kafka_str().to_string()),
            ("enable.idempotence", self.idempotent.to_string()),
            (
                "max.in.flight.requests.per.connection",
                self.max_in_flight.to_string(),
            ),
            ("retries", self.max_retries.to_string()),
            ("retry.backoff.ms", ms(self.retry_backoff)),
            ("linger.ms", ms(self.linger)),
            ("batch.size", self.batch_size_bytes.to_string()),
            ("compression.type", self.compression.as_str().to_string()),
            ("message.timeout.ms", ms(self.message_deadline())),
            (
                "queue.buffering.max.messages",
                self.queue_max_messages.to_string(),
            ),
            (
                "queue.buffering.max.kbytes",
                (self.queue_max_bytes / 1024).max(1).to_string(),
            ),
            ("message.max.bytes", self.max_message_bytes.to_string()),
        ]
    }
}
