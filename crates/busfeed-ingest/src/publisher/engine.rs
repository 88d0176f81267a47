//! Buffered producer engine
//!
//! [`BufferedPublisher`] is the caller-facing half: it validates, applies the
//! local queue limits and hands messages to a background task over a channel.
//! The background task owns everything else. It batches per partition, lingers,
//! compresses, keeps at most `max_in_flight` requests outstanding, retries with
//! backoff and enforces per-message deadlines. It sends one completion per
//! message back, and the caller serves those as delivery reports from
//! [`Publisher::pump`] and [`Publisher::drain`].
//!
//! With idempotence enabled every batch carries a producer id, an epoch and a
//! per-partition base sequence. A retried batch keeps its sequence, so the log
//! can discard duplicates. A batch that fails terminally bumps the partition's
//! epoch; the partition is held until its in-flight requests return and later
//! batches are re-sequenced from zero under the new epoch.
//!
//! Acknowledgments of a partition are released in batch order. A batch acked
//! while an earlier batch is still being retried is held until that batch
//! reaches its own outcome, so per-key acknowledgment order follows enqueue
//! order.

use super::config::{Acks, ConfigError, PublisherConfig};
use super::transport::{
    encode_batch, partition_for_key, BatchAck, LogTransport, ProduceRequest, ProducerStamp,
    TransportError, TransportErrorKind,
};
use super::{
    validate_request, DeliveryError, DeliveryHandler, DeliveryOutcome, DeliveryReport,
    EnqueueError, EnqueueRejected, PublishRequest, Publisher,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{error::Elapsed, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Caller side
// ============================================================================

/// Publisher over any [`LogTransport`]
///
/// Must be created inside a tokio runtime. Dropping it stops the background
/// task; anything not yet drained is abandoned.
pub struct BufferedPublisher {
    commands: mpsc::UnboundedSender<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    queue_max_messages: usize,
    queue_max_bytes: usize,
    max_message_bytes: usize,
    message_deadline: Duration,
    outstanding: usize,
    outstanding_bytes: usize,
    task: JoinHandle<()>,
}

impl BufferedPublisher {
    pub fn new<T: LogTransport>(
        config: PublisherConfig,
        transport: Arc<T>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();

        let publisher = Self {
            commands,
            completions,
            queue_max_messages: config.queue_max_messages,
            queue_max_bytes: config.queue_max_bytes,
            max_message_bytes: config.max_message_bytes,
            message_deadline: config.message_deadline(),
            outstanding: 0,
            outstanding_bytes: 0,
            task: tokio::spawn(Engine::new(config, transport, completion_tx).run(command_rx)),
        };
        Ok(publisher)
    }

    /// Buffered bytes not yet reported
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes
    }

    fn serve(&mut self, completion: Completion, handler: &mut dyn DeliveryHandler) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(completion.bytes);
        handler.on_delivery(completion.report);
    }
}

impl Drop for BufferedPublisher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Publisher for BufferedPublisher {
    fn enqueue(&mut self, request: PublishRequest) -> Result<(), EnqueueRejected> {
        if let Err(error) = validate_request(&request, self.max_message_bytes) {
            return Err(EnqueueRejected { error, request });
        }
        if self.commands.is_closed() {
            return Err(EnqueueRejected {
                error: EnqueueError::Closed,
                request,
            });
        }

        let size = request.size();
        if self.outstanding >= self.queue_max_messages
            || self.outstanding_bytes + size > self.queue_max_bytes
        {
            return Err(EnqueueRejected {
                error: EnqueueError::QueueFull {
                    capacity: self.queue_max_messages,
                },
                request,
            });
        }

        let now = Instant::now();
        let envelope = Envelope {
            topic: request.topic,
            key: request.key,
            payload: request.payload,
            token: request.token,
            size,
            enqueued_at: now,
            deadline: now + self.message_deadline,
        };

        if let Err(mpsc::error::SendError(Command::Produce(envelope))) =
            self.commands.send(Command::Produce(envelope))
        {
            return Err(EnqueueRejected {
                error: EnqueueError::Closed,
                request: envelope.into_request(),
            });
        }

        self.outstanding += 1;
        self.outstanding_bytes += size;
        Ok(())
    }

    fn pump(&mut self, handler: &mut dyn DeliveryHandler) -> usize {
        let mut served = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.serve(completion, handler);
            served += 1;
        }
        served
    }

    async fn drain(&mut self, timeout: Duration, handler: &mut dyn DeliveryHandler) -> usize {
        let deadline = Instant::now() + timeout;
        if self.commands.send(Command::Flush).is_err() {
            debug!("Engine stopped, serving buffered reports only");
        }

        while self.outstanding > 0 {
            match tokio::time::timeout_at(deadline, self.completions.recv()).await {
                Ok(Some(completion)) => self.serve(completion, handler),
                Ok(None) => {
                    warn!(
                        outstanding = self.outstanding,
                        "Engine exited with messages outstanding"
                    );
                    break;
                }
                Err(_) => break,
            }
        }

        if self.outstanding > 0 {
            warn!(
                unresolved = self.outstanding,
                timeout_ms = timeout.as_millis() as u64,
                "Drain timed out"
            );
        }
        self.outstanding
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }
}

// ============================================================================
// Channel messages
// ============================================================================

enum Command {
    Produce(Envelope),
    /// Send every lingering batch now
    Flush,
}

#[derive(Debug)]
struct Envelope {
    topic: String,
    key: String,
    payload: Vec<u8>,
    token: u64,
    size: usize,
    enqueued_at: Instant,
    deadline: Instant,
}

impl Envelope {
    fn into_request(self) -> PublishRequest {
        PublishRequest {
            topic: self.topic,
            key: self.key,
            payload: self.payload,
            token: self.token,
        }
    }
}

struct Completion {
    report: DeliveryReport,
    bytes: usize,
}

impl Completion {
    fn new(envelope: Envelope, outcome: DeliveryOutcome, attempts: u32, now: Instant) -> Self {
        Self {
            bytes: envelope.size,
            report: DeliveryReport {
                token: envelope.token,
                latency: now.saturating_duration_since(envelope.enqueued_at),
                key: envelope.key,
                outcome,
                attempts,
            },
        }
    }
}

fn complete(
    tx: &mpsc::UnboundedSender<Completion>,
    envelope: Envelope,
    outcome: DeliveryOutcome,
    attempts: u32,
    now: Instant,
) {
    // The caller side is gone; nobody is left to report to.
    let _ = tx.send(Completion::new(envelope, outcome, attempts, now));
}

// ============================================================================
// Background task
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TopicPartition {
    topic: String,
    partition: i32,
}

struct Batch {
    id: u64,
    records: Vec<Envelope>,
    bytes: usize,
    created_at: Instant,
    /// Transmissions so far
    attempts: u32,
    /// Resends counted against `max_retries`
    retries: u32,
    not_before: Option<Instant>,
    /// (epoch, base sequence) once stamped
    sequence: Option<(u32, i32)>,
}

impl Batch {
    fn new(id: u64, created_at: Instant) -> Self {
        Self {
            id,
            records: Vec::new(),
            bytes: 0,
            created_at,
            attempts: 0,
            retries: 0,
            not_before: None,
            sequence: None,
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.records.iter().map(|r| r.deadline).min()
    }
}

#[derive(Default)]
struct PartitionQueue {
    open: Option<Batch>,
    /// Closed batches, ordered by id
    ready: VecDeque<Batch>,
    next_sequence: i32,
    epoch: u32,
    in_flight: usize,
    /// Held after a terminal failure until in-flight requests return
    fenced: bool,
    /// Ids of batches without a final outcome, in creation order
    unresolved: VecDeque<u64>,
    /// Acknowledgments waiting for every earlier batch to resolve
    held: HashMap<u64, Vec<Completion>>,
}

impl PartitionQueue {
    fn open_batch(&mut self, id: u64, now: Instant) {
        self.unresolved.push_back(id);
        self.open = Some(Batch::new(id, now));
    }

    /// Mark a batch final and release every acknowledgment now in order
    fn resolve(&mut self, id: u64, acks: Vec<Completion>, tx: &mpsc::UnboundedSender<Completion>) {
        self.held.insert(id, acks);
        while let Some(front) = self.unresolved.front() {
            let Some(ready) = self.held.remove(front) else {
                break;
            };
            self.unresolved.pop_front();
            for completion in ready {
                let _ = tx.send(completion);
            }
        }
    }

    fn requeue(&mut self, batch: Batch) {
        let at = self
            .ready
            .iter()
            .position(|b| b.id > batch.id)
            .unwrap_or(self.ready.len());
        self.ready.insert(at, batch);
    }

    /// Start a new epoch after a sequenced batch of the current one failed
    fn reset_sequence(&mut self, failed: &Batch) {
        if matches!(failed.sequence, Some((epoch, _)) if epoch == self.epoch) {
            self.epoch += 1;
            self.next_sequence = 0;
            self.fenced = self.in_flight > 0;
        }
    }

    fn is_idle(&self) -> bool {
        self.open.is_none()
            && self.ready.is_empty()
            && self.in_flight == 0
            && self.unresolved.is_empty()
    }
}

struct SendOutcome {
    partition: TopicPartition,
    batch: Batch,
    result: Result<Result<BatchAck, TransportError>, Elapsed>,
}

struct Engine<T: LogTransport> {
    config: PublisherConfig,
    transport: Arc<T>,
    completions: mpsc::UnboundedSender<Completion>,
    producer_id: Option<i64>,
    /// Set when the producer id could not be obtained
    fatal: Option<String>,
    partition_counts: HashMap<String, u32>,
    queues: HashMap<TopicPartition, PartitionQueue>,
    in_flight: usize,
    flushing: bool,
    next_batch_id: u64,
}

impl<T: LogTransport> Engine<T> {
    fn new(
        config: PublisherConfig,
        transport: Arc<T>,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        Self {
            config,
            transport,
            completions,
            producer_id: None,
            fatal: None,
            partition_counts: HashMap::new(),
            queues: HashMap::new(),
            in_flight: 0,
            flushing: false,
            next_batch_id: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if self.config.idempotent {
            match self.transport.init_producer().await {
                Ok(id) => self.producer_id = Some(id),
                Err(e) => {
                    warn!(error = %e, "Could not obtain producer id");
                    self.fatal = Some(format!("producer id unavailable: {}", e));
                }
            }
        }
        info!(
            client_id = %self.config.client_id,
            idempotent = self.config.idempotent,
            producer_id = ?self.producer_id,
            acks = ?self.config.acks,
            compression = self.config.compression.as_str(),
            "Producer engine started"
        );

        let mut sends: FuturesUnordered<BoxFuture<'static, SendOutcome>> = FuturesUnordered::new();
        let mut closed = false;

        loop {
            let now = Instant::now();
            self.expire(now);
            self.seal_due(now);
            self.dispatch(now, &mut sends);

            let idle = self.queues.values().all(PartitionQueue::is_idle);
            if idle {
                self.flushing = false;
                if closed {
                    break;
                }
            }

            let wakeup = self.next_wakeup(now);
            let sleep = tokio::time::sleep_until(wakeup.unwrap_or(now + Duration::from_secs(3600)));

            tokio::select! {
                command = commands.recv(), if !closed => match command {
                    Some(Command::Produce(envelope)) => self.accept(envelope).await,
                    Some(Command::Flush) => self.flushing = true,
                    None => {
                        closed = true;
                        self.flushing = true;
                    }
                },
                Some(outcome) = sends.next(), if !sends.is_empty() => {
                    self.settle(outcome, Instant::now());
                },
                _ = sleep, if wakeup.is_some() => {},
                else => break,
            }
        }

        debug!("Producer engine stopped");
    }

    async fn accept(&mut self, envelope: Envelope) {
        if let Some(reason) = &self.fatal {
            let outcome = DeliveryOutcome::Failed(DeliveryError::Fatal(reason.clone()));
            complete(&self.completions, envelope, outcome, 0, Instant::now());
            return;
        }

        let count = match self.partition_counts.get(&envelope.topic) {
            Some(count) => *count,
            None => match self.transport.partition_count(&envelope.topic).await {
                Ok(count) => {
                    debug!(topic = %envelope.topic, partitions = count, "Resolved topic metadata");
                    self.partition_counts.insert(envelope.topic.clone(), count);
                    count
                }
                Err(e) => {
                    warn!(topic = %envelope.topic, error = %e, "Topic metadata unavailable");
                    let outcome = DeliveryOutcome::Failed(DeliveryError::Rejected(e.to_string()));
                    complete(&self.completions, envelope, outcome, 0, Instant::now());
                    return;
                }
            },
        };

        let now = Instant::now();
        let key = TopicPartition {
            topic: envelope.topic.clone(),
            partition: partition_for_key(envelope.key.as_bytes(), count),
        };
        let batch_size = self.config.batch_size_bytes;
        let queue = self.queues.entry(key).or_default();

        let overflows = queue.open.as_ref().is_some_and(|open| {
            !open.records.is_empty() && open.bytes + envelope.size > batch_size
        });
        if overflows {
            if let Some(full) = queue.open.take() {
                queue.ready.push_back(full);
            }
        }

        if queue.open.is_none() {
            self.next_batch_id += 1;
            queue.open_batch(self.next_batch_id, now);
        }
        if let Some(open) = queue.open.as_mut() {
            open.bytes += envelope.size;
            open.records.push(envelope);
            if open.bytes >= batch_size {
                if let Some(full) = queue.open.take() {
                    queue.ready.push_back(full);
                }
            }
        }
    }

    /// Close open batches that have lingered long enough
    fn seal_due(&mut self, now: Instant) {
        let linger = self.config.linger;
        let flushing = self.flushing;
        for queue in self.queues.values_mut() {
            let due = queue
                .open
                .as_ref()
                .is_some_and(|open| flushing || open.created_at + linger <= now);
            if due {
                if let Some(batch) = queue.open.take() {
                    queue.ready.push_back(batch);
                }
            }
        }
    }

    /// Fail every buffered message whose deadline has passed
    fn expire(&mut self, now: Instant) {
        let tx = &self.completions;
        for queue in self.queues.values_mut() {
            if let Some(open) = queue.open.as_mut() {
                expire_records(tx, open, now);
                if open.records.is_empty() {
                    let id = open.id;
                    queue.open = None;
                    queue.resolve(id, Vec::new(), tx);
                }
            }

            let mut kept = VecDeque::with_capacity(queue.ready.len());
            while let Some(mut batch) = queue.ready.pop_front() {
                let expired = batch.earliest_deadline().is_some_and(|d| d <= now);
                if expired && batch.sequence.is_some() {
                    warn!(
                        batch = batch.id,
                        records = batch.records.len(),
                        attempts = batch.attempts,
                        "Sequenced batch expired before acknowledgment"
                    );
                    queue.reset_sequence(&batch);
                    let id = batch.id;
                    fail_batch(tx, batch, DeliveryError::Timeout, now);
                    queue.resolve(id, Vec::new(), tx);
                    continue;
                }
                if expired {
                    expire_records(tx, &mut batch, now);
                }
                if batch.records.is_empty() {
                    queue.resolve(batch.id, Vec::new(), tx);
                } else {
                    kept.push_back(batch);
                }
            }
            queue.ready = kept;
        }
    }

    fn dispatch(
        &mut self,
        now: Instant,
        sends: &mut FuturesUnordered<BoxFuture<'static, SendOutcome>>,
    ) {
        let max_in_flight = self.config.max_in_flight;
        for (key, queue) in self.queues.iter_mut() {
            while self.in_flight < max_in_flight && !queue.fenced {
                let Some(front) = queue.ready.front() else {
                    break;
                };
                if front.not_before.is_some_and(|t| t > now) {
                    break;
                }
                let Some(mut batch) = queue.ready.pop_front() else {
                    break;
                };

                let encoded = encode_batch(
                    batch
                        .records
                        .iter()
                        .map(|r| (r.key.as_bytes(), r.payload.as_slice())),
                    self.config.compression,
                );
                let encoded = match encoded {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(batch = batch.id, error = %e, "Could not encode batch");
                        queue.reset_sequence(&batch);
                        let id = batch.id;
                        let error = DeliveryError::Rejected(e.to_string());
                        fail_batch(&self.completions, batch, error, now);
                        queue.resolve(id, Vec::new(), &self.completions);
                        continue;
                    }
                };

                let producer = self.producer_id.map(|producer_id| {
                    let (epoch, base_sequence) = match batch.sequence {
                        Some((epoch, base)) if epoch == queue.epoch => (epoch, base),
                        _ => {
                            let base = queue.next_sequence;
                            queue.next_sequence += batch.records.len() as i32;
                            (queue.epoch, base)
                        }
                    };
                    batch.sequence = Some((epoch, base_sequence));
                    ProducerStamp {
                        producer_id,
                        epoch,
                        base_sequence,
                    }
                });

                batch.attempts += 1;
                batch.not_before = None;
                queue.in_flight += 1;
                self.in_flight += 1;

                debug!(
                    topic = %key.topic,
                    partition = key.partition,
                    batch = batch.id,
                    records = batch.records.len(),
                    attempt = batch.attempts,
                    sequence = ?batch.sequence,
                    "Sending batch"
                );

                let request = ProduceRequest {
                    topic: key.topic.clone(),
                    partition: key.partition,
                    acks: self.config.acks,
                    producer,
                    batch: encoded,
                };
                sends.push(transmit(Arc::clone(&self.transport), key.clone(), batch, request));
            }
        }
    }

    fn settle(&mut self, outcome: SendOutcome, now: Instant) {
        let SendOutcome {
            partition,
            mut batch,
            result,
        } = outcome;
        self.in_flight = self.in_flight.saturating_sub(1);
        let queue = self.queues.entry(partition.clone()).or_default();
        queue.in_flight = queue.in_flight.saturating_sub(1);

        match result {
            Ok(Ok(ack)) => {
                let (id, attempts) = (batch.id, batch.attempts);
                let acks = batch
                    .records
                    .into_iter()
                    .enumerate()
                    .map(|(i, envelope)| {
                        let offset = if ack.base_offset < 0 {
                            -1
                        } else {
                            ack.base_offset + i as i64
                        };
                        let outcome = DeliveryOutcome::Acknowledged {
                            topic: partition.topic.clone(),
                            partition: partition.partition,
                            offset,
                        };
                        Completion::new(envelope, outcome, attempts, now)
                    })
                    .collect::<Vec<_>>();
                if queue.unresolved.front().is_some_and(|front| *front != id) {
                    debug!(
                        batch = id,
                        records = acks.len(),
                        "Holding acknowledgments behind an earlier batch"
                    );
                }
                queue.resolve(id, acks, &self.completions);
            }
            Err(_) => {
                warn!(
                    topic = %partition.topic,
                    partition = partition.partition,
                    batch = batch.id,
                    "Batch deadline passed while in flight"
                );
                queue.reset_sequence(&batch);
                let id = batch.id;
                fail_batch(&self.completions, batch, DeliveryError::Timeout, now);
                queue.resolve(id, Vec::new(), &self.completions);
            }
            Ok(Err(e))
                if e.kind == TransportErrorKind::OutOfOrderSequence && batch.sequence.is_some() =>
            {
                debug!(batch = batch.id, error = %e, "Batch ahead of its predecessor, resending");
                batch.not_before = Some(now + self.config.retry_backoff);
                queue.requeue(batch);
            }
            Ok(Err(e))
                if e.is_retriable()
                    && self.config.acks != Acks::None
                    && batch.retries < self.config.max_retries =>
            {
                batch.retries += 1;
                warn!(
                    topic = %partition.topic,
                    partition = partition.partition,
                    batch = batch.id,
                    retry = batch.retries,
                    error = %e,
                    "Retrying batch"
                );
                batch.not_before = Some(now + self.config.retry_backoff);
                queue.requeue(batch);
            }
            Ok(Err(e)) => {
                let error = if e.is_retriable() {
                    DeliveryError::RetriesExhausted {
                        attempts: batch.attempts,
                        last_error: e.to_string(),
                    }
                } else {
                    DeliveryError::Rejected(e.to_string())
                };
                warn!(
                    topic = %partition.topic,
                    partition = partition.partition,
                    batch = batch.id,
                    records = batch.records.len(),
                    error = %error,
                    "Batch failed"
                );
                queue.reset_sequence(&batch);
                let id = batch.id;
                fail_batch(&self.completions, batch, error, now);
                queue.resolve(id, Vec::new(), &self.completions);
            }
        }

        if queue.fenced && queue.in_flight == 0 {
            debug!(
                topic = %partition.topic,
                partition = partition.partition,
                epoch = queue.epoch,
                "Partition resumed under new epoch"
            );
            queue.fenced = false;
        }
    }

    /// Earliest future instant at which some batch needs attention
    fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |t: Instant| {
            if t > now {
                next = Some(next.map_or(t, |n| n.min(t)));
            }
        };

        for queue in self.queues.values() {
            if let Some(open) = &queue.open {
                consider(open.created_at + self.config.linger);
                if let Some(deadline) = open.earliest_deadline() {
                    consider(deadline);
                }
            }
            for batch in &queue.ready {
                if let Some(t) = batch.not_before {
                    consider(t);
                }
                if let Some(deadline) = batch.earliest_deadline() {
                    consider(deadline);
                }
            }
        }
        next
    }
}

fn transmit<T: LogTransport>(
    transport: Arc<T>,
    partition: TopicPartition,
    batch: Batch,
    request: ProduceRequest,
) -> BoxFuture<'static, SendOutcome> {
    async move {
        let deadline = batch.earliest_deadline().unwrap_or_else(Instant::now);
        let result = tokio::time::timeout_at(deadline, transport.produce(request)).await;
        SendOutcome {
            partition,
            batch,
            result,
        }
    }
    .boxed()
}

fn fail_batch(
    tx: &mpsc::UnboundedSender<Completion>,
    batch: Batch,
    error: DeliveryError,
    now: Instant,
) {
    let attempts = batch.attempts;
    for envelope in batch.records {
        complete(tx, envelope, DeliveryOutcome::Failed(error.clone()), attempts, now);
    }
}

/// Fail the expired records of a batch that has not been sequenced
fn expire_records(tx: &mpsc::UnboundedSender<Completion>, batch: &mut Batch, now: Instant) {
    if !batch.records.iter().any(|r| r.deadline <= now) {
        return;
    }
    let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut batch.records)
        .into_iter()
        .partition(|r| r.deadline <= now);
    debug!(batch = batch.id, expired = expired.len(), "Messages expired in buffer");

    batch.bytes = kept.iter().map(|r| r.size).sum();
    batch.records = kept;
    for envelope in expired {
        complete(
            tx,
            envelope,
            DeliveryOutcome::Failed(DeliveryError::Timeout),
            batch.attempts,
            now,
        );
    }
}
