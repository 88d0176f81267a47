//! In-process partitioned log
//!
//! [`MemoryLog`] implements [`LogTransport`] entirely in memory. It enforces the
//! same idempotent-producer rules a broker does (per-partition sequence checks,
//! duplicate detection over the last five batches, epoch fencing) and can inject
//! faults, so the producer engine's retry and ordering behavior can be exercised
//! without a cluster. The CLI uses it for `--dry-run`.

use super::config::Acks;
use super::transport::{
    decode_batch, BatchAck, LogTransport, ProduceRequest, TransportError, TransportErrorKind,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// Batches remembered per producer and partition for duplicate detection
const DEDUP_WINDOW: usize = 5;

/// A persisted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Scripted misbehavior, consumed one per produce request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Reject the request without appending
    Fail(TransportErrorKind),
    /// Append the batch, then lose the acknowledgment
    LoseAck,
    /// Hold the request before handling it
    Delay(Duration),
}

#[derive(Debug, Default)]
struct BatchMeta {
    base_sequence: i32,
    record_count: u32,
    base_offset: i64,
}

#[derive(Debug, Default)]
struct ProducerState {
    epoch: u32,
    next_sequence: i32,
    recent: VecDeque<BatchMeta>,
}

#[derive(Debug, Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    producers: HashMap<(i64, String, i32), ProducerState>,
    next_producer_id: i64,
    faults: VecDeque<Fault>,
    unavailable: bool,
    requests: u64,
}

/// In-memory partitioned, append-only log
#[derive(Debug)]
pub struct MemoryLog {
    partitions: u32,
    latency: Duration,
    state: Mutex<LogState>,
}

impl MemoryLog {
    /// A log whose topics all have `partitions` partitions
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            latency: Duration::ZERO,
            state: Mutex::new(LogState::default()),
        }
    }

    /// Delay every request by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a fault for the next unfaulted request
    pub fn inject(&self, fault: Fault) {
        self.state().faults.push_back(fault);
    }

    /// Queue the same fault for the next `n` requests
    pub fn inject_n(&self, fault: Fault, n: usize) {
        let mut state = self.state();
        state.faults.extend(std::iter::repeat(fault).take(n));
    }

    /// While set, every request fails with a network error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Every record of `topic`, partition by partition, in offset order
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        self.state()
            .topics
            .get(topic)
            .map(|parts| parts.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Records of `topic` with partition key `key`, in offset order
    pub fn records_for_key(&self, topic: &str, key: &str) -> Vec<StoredRecord> {
        self.records(topic)
            .into_iter()
            .filter(|r| r.key == key)
            .collect()
    }

    /// Message count per partition of `topic`
    pub fn partition_sizes(&self, topic: &str) -> Vec<usize> {
        self.state()
            .topics
            .get(topic)
            .map(|parts| parts.iter().map(Vec::len).collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self, topic: &str) -> usize {
        self.partition_sizes(topic).iter().sum()
    }

    /// Produce requests received, faulted ones included
    pub fn request_count(&self) -> u64 {
        self.state().requests
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, request: &ProduceRequest) -> Result<BatchAck, TransportError> {
        let records = decode_batch(&request.batch)?;
        let mut state = self.state();

        if let Some(stamp) = request.producer {
            let key = (stamp.producer_id, request.topic.clone(), request.partition);
            let producer = state.producers.entry(key).or_default();

            if stamp.epoch < producer.epoch {
                return Err(TransportError::new(
                    TransportErrorKind::ProducerFenced,
                    format!("epoch {} is older than {}", stamp.epoch, producer.epoch),
                ));
            }
            if stamp.epoch > producer.epoch {
                *producer = ProducerState {
                    epoch: stamp.epoch,
                    ..Default::default()
                };
            }

            if let Some(seen) = producer
                .recent
                .iter()
                .find(|b| b.base_sequence == stamp.base_sequence)
            {
                if seen.record_count == request.batch.record_count {
                    trace!(
                        partition = request.partition,
                        sequence = stamp.base_sequence,
                        "Duplicate batch acknowledged with original offset"
                    );
                    return Ok(BatchAck {
                        base_offset: seen.base_offset,
                    });
                }
            }

            if stamp.base_sequence != producer.next_sequence {
                return Err(TransportError::new(
                    TransportErrorKind::OutOfOrderSequence,
                    format!(
                        "expected sequence {}, got {}",
                        producer.next_sequence, stamp.base_sequence
                    ),
                ));
            }
        }

        let partitions = self.partitions as usize;
        let log = state
            .topics
            .entry(request.topic.clone())
            .or_insert_with(|| vec![Vec::new(); partitions]);
        let partition = log.get_mut(request.partition as usize).ok_or_else(|| {
            TransportError::new(
                TransportErrorKind::UnknownTopic,
                format!("{} has no partition {}", request.topic, request.partition),
            )
        })?;

        let base_offset = partition.len() as i64;
        for (i, record) in records.into_iter().enumerate() {
            partition.push(StoredRecord {
                partition: request.partition,
                offset: base_offset + i as i64,
                key: String::from_utf8_lossy(&record.key).into_owned(),
                payload: record.value,
            });
        }

        if let Some(stamp) = request.producer {
            let key = (stamp.producer_id, request.topic.clone(), request.partition);
            let producer = state.producers.entry(key).or_default();
            producer.next_sequence = stamp.base_sequence + request.batch.record_count as i32;
            producer.recent.push_back(BatchMeta {
                base_sequence: stamp.base_sequence,
                record_count: request.batch.record_count,
                base_offset,
            });
            if producer.recent.len() > DEDUP_WINDOW {
                producer.recent.pop_front();
            }
        }

        debug!(
            topic = %request.topic,
            partition = request.partition,
            base_offset,
            records = request.batch.record_count,
            "Appended batch"
        );

        Ok(BatchAck {
            base_offset: if request.acks == Acks::None { -1 } else { base_offset },
        })
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn partition_count(&self, _topic: &str) -> Result<u32, TransportError> {
        Ok(self.partitions)
    }

    async fn init_producer(&self) -> Result<i64, TransportError> {
        let mut state = self.state();
        state.next_producer_id += 1;
        Ok(state.next_producer_id)
    }

    async fn produce(&self, request: ProduceRequest) -> Result<BatchAck, TransportError> {
        let (fault, unavailable) = {
            let mut state = self.state();
            state.requests += 1;
            (state.faults.pop_front(), state.unavailable)
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if unavailable {
            return Err(TransportError::new(TransportErrorKind::Network, "log unavailable"));
        }

        match fault {
            Some(Fault::Fail(kind)) => Err(TransportError::new(kind, "injected fault")),
            Some(Fault::LoseAck) => {
                self.append(&request)?;
                Err(TransportError::new(TransportErrorKind::Network, "acknowledgment lost"))
            }
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                self.append(&request)
            }
            None => self.append(&request),
        }
    }
}
