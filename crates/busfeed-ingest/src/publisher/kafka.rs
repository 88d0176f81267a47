//! Kafka publisher backed by librdkafka
//!
//! librdkafka already implements batching, retries, idempotence and the local
//! queue limits, so this publisher only translates. Requests become
//! `BaseRecord`s. The delivery callback, invoked from `poll`, forwards each
//! outcome to a channel that `pump` and `drain` serve from.

use super::config::{ConfigError, PublisherConfig};
use super::{
    validate_request, DeliveryError, DeliveryHandler, DeliveryOutcome, DeliveryReport,
    EnqueueError, EnqueueRejected, PublishRequest, Publisher,
};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::ClientContext;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-message state carried through librdkafka as the delivery opaque
struct Pending {
    token: u64,
    key: String,
    size: usize,
    enqueued_at: Instant,
}

struct Delivered {
    report: DeliveryReport,
    bytes: usize,
}

/// Forwards librdkafka delivery callbacks to the publisher
struct ReportingContext {
    reports: mpsc::UnboundedSender<Delivered>,
}

impl ClientContext for ReportingContext {}

impl ProducerContext for ReportingContext {
    type DeliveryOpaque = Box<Pending>;

    fn delivery(&self, result: &DeliveryResult<'_>, pending: Self::DeliveryOpaque) {
        let outcome = match result {
            Ok(message) => DeliveryOutcome::Acknowledged {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
            Err((error, _)) => DeliveryOutcome::Failed(delivery_error(error)),
        };

        let Pending {
            token,
            key,
            size,
            enqueued_at,
        } = *pending;
        let delivered = Delivered {
            bytes: size,
            report: DeliveryReport {
                token,
                key,
                outcome,
                attempts: 1,
                latency: enqueued_at.elapsed(),
            },
        };
        // Receiver dropped means the publisher is gone.
        let _ = self.reports.send(delivered);
    }
}

fn delivery_error(error: &KafkaError) -> DeliveryError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut) => DeliveryError::Timeout,
        Some(
            RDKafkaErrorCode::Fatal
            | RDKafkaErrorCode::InvalidProducerEpoch
            | RDKafkaErrorCode::ProducerFenced,
        ) => DeliveryError::Fatal(error.to_string()),
        Some(
            RDKafkaErrorCode::NotEnoughReplicas
            | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::RequestTimedOut,
        ) => DeliveryError::RetriesExhausted {
            attempts: 1,
            last_error: error.to_string(),
        },
        _ => DeliveryError::Rejected(error.to_string()),
    }
}

fn enqueue_error(
    error: &KafkaError,
    queue_max_messages: usize,
    size: usize,
    max: usize,
) -> EnqueueError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) => EnqueueError::QueueFull {
            capacity: queue_max_messages,
        },
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => EnqueueError::MessageTooLarge { size, max },
        Some(RDKafkaErrorCode::UnknownTopic | RDKafkaErrorCode::UnknownTopicOrPartition) => {
            EnqueueError::InvalidTopic(error.to_string())
        }
        _ => EnqueueError::Closed,
    }
}

/// Publisher writing to a Kafka cluster
pub struct KafkaPublisher {
    producer: BaseProducer<ReportingContext>,
    reports: mpsc::UnboundedReceiver<Delivered>,
    queue_max_messages: usize,
    max_message_bytes: usize,
    outstanding: usize,
    outstanding_bytes: usize,
}

impl KafkaPublisher {
    pub fn new(config: &PublisherConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut client = ClientConfig::new();
        for (name, value) in config.kafka_properties() {
            client.set(name, value);
        }

        let (tx, reports) = mpsc::unbounded_channel();
        let producer: BaseProducer<ReportingContext> = client
            .create_with_context(ReportingContext { reports: tx })
            .map_err(|e| ConfigError::Invalid(format!("failed to create producer: {}", e)))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            idempotent = config.idempotent,
            compression = config.compression.as_str(),
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            reports,
            queue_max_messages: config.queue_max_messages,
            max_message_bytes: config.max_message_bytes,
            outstanding: 0,
            outstanding_bytes: 0,
        })
    }

    fn serve_ready(&mut self, handler: &mut dyn DeliveryHandler) -> usize {
        let mut served = 0;
        while let Ok(delivered) = self.reports.try_recv() {
            self.outstanding = self.outstanding.saturating_sub(1);
            self.outstanding_bytes = self.outstanding_bytes.saturating_sub(delivered.bytes);
            handler.on_delivery(delivered.report);
            served += 1;
        }
        served
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    fn enqueue(&mut self, request: PublishRequest) -> Result<(), EnqueueRejected> {
        if let Err(error) = validate_request(&request, self.max_message_bytes) {
            return Err(EnqueueRejected { error, request });
        }

        let size = request.size();
        let pending = Box::new(Pending {
            token: request.token,
            key: request.key.clone(),
            size,
            enqueued_at: Instant::now(),
        });
        let record = BaseRecord::with_opaque_to(&request.topic, pending)
            .key(request.key.as_str())
            .payload(request.payload.as_slice());

        let sent = self.producer.send(record).map_err(|(error, _)| error);
        if let Err(error) = sent {
            debug!(error = %error, token = request.token, "librdkafka refused message");
            let error =
                enqueue_error(&error, self.queue_max_messages, size, self.max_message_bytes);
            return Err(EnqueueRejected { error, request });
        }

        self.outstanding += 1;
        self.outstanding_bytes += size;
        Ok(())
    }

    fn pump(&mut self, handler: &mut dyn DeliveryHandler) -> usize {
        self.producer.poll(Duration::ZERO);
        self.serve_ready(handler)
    }

    async fn drain(&mut self, timeout: Duration, handler: &mut dyn DeliveryHandler) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            self.producer.poll(Duration::ZERO);
            self.serve_ready(handler);
            if self.outstanding == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if self.outstanding > 0 {
            warn!(
                unresolved = self.outstanding,
                in_flight = self.producer.in_flight_count(),
                "Drain timed out"
            );
        }
        self.outstanding
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }
}
