//! Wire contract between the producer engine and a log service
//!
//! A [`LogTransport`] moves one compressed record batch for one partition per
//! request. Batches are framed as a sequence of length-prefixed key/value pairs:
//!
//! ```text
//! [key_len: u32 BE][key bytes][value_len: u32 BE][value bytes] ...
//! ```
//!
//! and the whole frame is compressed with the batch's codec.

use super::config::{Acks, CompressionType};
use async_trait::async_trait;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};
use thiserror::Error;

const ZSTD_LEVEL: i32 = 3;

/// Producer identity attached to batches when idempotence is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerStamp {
    pub producer_id: i64,
    /// Bumped by the producer after a sequenced batch fails terminally
    pub epoch: u32,
    /// Sequence number of the first record in the batch
    pub base_sequence: i32,
}

/// Compressed, framed records for a single partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub compression: CompressionType,
    pub record_count: u32,
    pub data: Vec<u8>,
}

/// A decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub topic: String,
    pub partition: i32,
    pub acks: Acks,
    pub producer: Option<ProducerStamp>,
    pub batch: RecordBatch,
}

/// Successful append of a whole batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchAck {
    /// Offset of the first record; -1 when `acks=none`
    pub base_offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection dropped or request lost
    Network,
    /// Partition leadership moved
    NotLeader,
    /// Idempotent batch arrived ahead of its predecessor
    OutOfOrderSequence,
    /// Newer producer epoch already seen for this partition
    ProducerFenced,
    MessageTooLarge,
    CorruptBatch,
    UnknownTopic,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether resending the same batch may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Network
                | TransportErrorKind::NotLeader
                | TransportErrorKind::OutOfOrderSequence
        )
    }
}

/// Connection to a partitioned log service
#[async_trait]
pub trait LogTransport: Send + Sync + 'static {
    /// Number of partitions of `topic`
    async fn partition_count(&self, topic: &str) -> Result<u32, TransportError>;

    /// Allocate a producer id for idempotent production
    async fn init_producer(&self) -> Result<i64, TransportError>;

    /// Append one batch to one partition
    async fn produce(&self, request: ProduceRequest) -> Result<BatchAck, TransportError>;
}

/// Stable key-to-partition assignment
pub fn partition_for_key(key: &[u8], partition_count: u32) -> i32 {
    let hash = blake3::hash(key);
    let bytes = hash.as_bytes();
    let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (value % partition_count.max(1)) as i32
}

/// Frame and compress `records` into a batch
pub fn encode_batch<'a, I>(records: I, compression: CompressionType) -> std::io::Result<RecordBatch>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut frame = Vec::new();
    let mut record_count = 0u32;
    for (key, value) in records {
        for part in [key, value] {
            let len = u32::try_from(part.len()).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "record too large")
            })?;
            frame.extend_from_slice(&len.to_be_bytes());
            frame.extend_from_slice(part);
        }
        record_count += 1;
    }

    let data = match compression {
        CompressionType::None => frame,
        CompressionType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&frame)?;
            encoder.finish()?
        }
        CompressionType::Zstd => zstd::encode_all(frame.as_slice(), ZSTD_LEVEL)?,
    };

    Ok(RecordBatch {
        compression,
        record_count,
        data,
    })
}

/// Decompress and unframe a batch
pub fn decode_batch(batch: &RecordBatch) -> Result<Vec<WireRecord>, TransportError> {
    let corrupt = |msg: String| TransportError::new(TransportErrorKind::CorruptBatch, msg);

    let frame = match batch.compression {
        CompressionType::None => batch.data.clone(),
        CompressionType::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(batch.data.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| corrupt(format!("gzip: {}", e)))?;
            out
        }
        CompressionType::Zstd => zstd::decode_all(batch.data.as_slice())
            .map_err(|e| corrupt(format!("zstd: {}", e)))?,
    };

    let mut records = Vec::with_capacity(batch.record_count as usize);
    let mut rest = frame.as_slice();
    while !rest.is_empty() {
        let key = take_field(&mut rest).ok_or_else(|| corrupt("truncated key".into()))?;
        let value = take_field(&mut rest).ok_or_else(|| corrupt("truncated value".into()))?;
        records.push(WireRecord {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    if records.len() != batch.record_count as usize {
        return Err(corrupt(format!(
            "expected {} records, found {}",
            batch.record_count,
            records.len()
        )));
    }
    Ok(records)
}

fn take_field<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    let (len, tail) = rest.split_first_chunk::<4>()?;
    let len = u32::from_be_bytes(*len) as usize;
    if tail.len() < len {
        return None;
    }
    let (field, tail) = tail.split_at(len);
    *rest = tail;
    Some(field)
}
