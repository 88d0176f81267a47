//! Ingestion driver
//!
//! Pulls rows from a source, normalizes and encodes them, hands them to a
//! [`Publisher`] and keeps the books. The loop is single threaded and
//! cooperative: it pumps delivery reports every `pump_interval` rows and drains
//! the publisher once the source is exhausted or the record cap is hit.
//!
//! Every row ends up in exactly one bucket of [`RunAccounting`]:
//!
//! ```text
//! total_seen   = normalization_failed + sent + enqueue_rejected
//! sent         = acknowledged + delivery_failed + unresolved
//! ```

use crate::encoder::{JsonEncoder, PayloadEncoder};
use crate::ledger::DeliveryLedger;
use crate::publisher::{PublishRequest, Publisher};
use crate::record::{normalize, RawRecord};
use crate::source::{CsvRowSource, SourceError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_TOPIC: &str = "bus-gps-tracking";
pub const DEFAULT_PUMP_INTERVAL: u64 = 100;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Success rate at or above which a run is healthy
pub const HEALTHY_THRESHOLD: f64 = 90.0;
/// Success rate at or above which a run is degraded rather than failing
pub const DEGRADED_THRESHOLD: f64 = 70.0;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub topic: String,
    /// Stop after this many rows; `None` reads the whole source
    pub max_records: Option<u64>,
    /// Rows between pumps (and progress events)
    pub pump_interval: u64,
    pub drain_timeout: Duration,
    /// Extra enqueue attempts after `QueueFull`, each preceded by a pump
    pub enqueue_retries: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            max_records: None,
            pump_interval: DEFAULT_PUMP_INTERVAL,
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            enqueue_retries: 0,
        }
    }
}

/// Per-bucket row counts of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunAccounting {
    pub total_seen: u64,
    pub normalization_failed: u64,
    pub sent: u64,
    pub enqueue_rejected: u64,
    pub acknowledged: u64,
    pub delivery_failed: u64,
    pub unresolved: u64,
    /// Delivery reports that matched no pending message
    pub anomalies: u64,
}

/// Overall health of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    Degraded,
    Failing,
}

impl Verdict {
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= HEALTHY_THRESHOLD {
            Verdict::Healthy
        } else if rate >= DEGRADED_THRESHOLD {
            Verdict::Degraded
        } else {
            Verdict::Failing
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Healthy => "HEALTHY",
            Verdict::Degraded => "DEGRADED",
            Verdict::Failing => "FAILING",
        };
        f.write_str(label)
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub topic: String,
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub acknowledged: u64,
    /// Acknowledged rows as a percentage of all rows seen
    pub success_rate: f64,
    pub unresolved: u64,
    /// Mean enqueue-to-outcome latency of resolved messages
    pub mean_latency_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accounting: RunAccounting,
    pub failures_by_kind: BTreeMap<String, u64>,
}

impl RunReport {
    pub fn verdict(&self) -> Verdict {
        Verdict::from_success_rate(self.success_rate)
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} on topic '{}'", self.run_id, self.topic)?;
        writeln!(f, "  total:        {}", self.total)?;
        writeln!(f, "  sent:         {}", self.sent)?;
        writeln!(f, "  acknowledged: {}", self.acknowledged)?;
        writeln!(f, "  failed:       {}", self.failed)?;
        if self.unresolved > 0 {
            writeln!(f, "  unresolved:   {}", self.unresolved)?;
        }
        for (kind, count) in &self.failures_by_kind {
            writeln!(f, "    {:<20} {}", kind, count)?;
        }
        writeln!(f, "  success rate: {:.2}%", self.success_rate)?;
        if let Some(latency) = self.mean_latency_ms {
            writeln!(f, "  mean latency: {} ms", latency)?;
        }
        writeln!(f, "  elapsed:      {} ms", self.elapsed().num_milliseconds())?;
        write!(f, "  verdict:      {}", self.verdict())
    }
}

/// Snapshot handed to the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub total_seen: u64,
    pub sent: u64,
    pub acknowledged: u64,
    /// Failures known so far (normalization, enqueue and delivery)
    pub failed: u64,
}

type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

pub struct IngestionDriver<P: Publisher, E: PayloadEncoder = JsonEncoder> {
    publisher: P,
    encoder: E,
    config: DriverConfig,
    ledger: DeliveryLedger,
    on_progress: Option<ProgressCallback>,
}

impl<P: Publisher> IngestionDriver<P, JsonEncoder> {
    pub fn new(publisher: P, config: DriverConfig) -> Self {
        Self::with_encoder(publisher, JsonEncoder, config)
    }
}

impl<P: Publisher, E: PayloadEncoder> IngestionDriver<P, E> {
    pub fn with_encoder(publisher: P, encoder: E, config: DriverConfig) -> Self {
        Self {
            publisher,
            encoder,
            config,
            ledger: DeliveryLedger::new(),
            on_progress: None,
        }
    }

    /// Call `callback` at every pump
    pub fn on_progress(mut self, callback: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Ledger of the most recent run
    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    /// Open `path` and run over every row.
    ///
    /// A missing or unreadable file is fatal and no report is produced.
    pub async fn ingest_file(&mut self, path: impl AsRef<Path>) -> Result<RunReport, SourceError> {
        let path = path.as_ref();
        let source = CsvRowSource::open(path)?;
        info!(path = %path.display(), columns = source.headers().len(), "Opened source");
        Ok(self.run(source.rows()).await)
    }

    /// Publish every row and wait for delivery outcomes.
    pub async fn run<I>(&mut self, rows: I) -> RunReport
    where
        I: IntoIterator<Item = Result<RawRecord, SourceError>>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let pump_interval = self.config.pump_interval.max(1);
        self.ledger = DeliveryLedger::new();
        let mut acc = RunAccounting::default();

        info!(
            %run_id,
            topic = %self.config.topic,
            max_records = ?self.config.max_records,
            "Starting ingestion"
        );

        let mut rows = rows.into_iter();
        loop {
            if self.config.max_records.is_some_and(|max| acc.total_seen >= max) {
                info!(limit = acc.total_seen, "Record limit reached");
                break;
            }
            let Some(row) = rows.next() else {
                break;
            };
            acc.total_seen += 1;
            let token = acc.total_seen;

            if let Some(request) = self.prepare(token, row) {
                self.submit(request, &mut acc).await;
            } else {
                acc.normalization_failed += 1;
            }

            if acc.total_seen % pump_interval == 0 {
                let served = self.publisher.pump(&mut self.ledger);
                debug!(served, outstanding = self.publisher.outstanding(), "Pumped");
                self.report_progress(&acc);
            }
        }

        info!(
            outstanding = self.publisher.outstanding(),
            timeout_secs = self.config.drain_timeout.as_secs(),
            "Source exhausted, draining"
        );
        let unresolved = self
            .publisher
            .drain(self.config.drain_timeout, &mut self.ledger)
            .await as u64;
        if unresolved > 0 {
            warn!(unresolved, "Messages unresolved at shutdown");
        }

        acc.acknowledged = self.ledger.acknowledged();
        acc.delivery_failed = self.ledger.failed();
        acc.unresolved = unresolved;
        acc.anomalies = self.ledger.anomalies();
        self.report_progress(&acc);

        let failed =
            acc.normalization_failed + acc.enqueue_rejected + acc.delivery_failed + acc.unresolved;
        let success_rate = if acc.total_seen == 0 {
            0.0
        } else {
            acc.acknowledged as f64 / acc.total_seen as f64 * 100.0
        };

        let report = RunReport {
            run_id,
            topic: self.config.topic.clone(),
            total: acc.total_seen,
            sent: acc.sent,
            failed,
            acknowledged: acc.acknowledged,
            success_rate,
            unresolved,
            mean_latency_ms: self
                .ledger
                .mean_latency()
                .map(|latency| latency.as_millis() as u64),
            started_at,
            finished_at: Utc::now(),
            failures_by_kind: self
                .ledger
                .failures_by_kind()
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
            accounting: acc,
        };

        info!(
            %run_id,
            total = report.total,
            sent = report.sent,
            acknowledged = report.acknowledged,
            failed = report.failed,
            unresolved = report.unresolved,
            success_rate = report.success_rate,
            verdict = %report.verdict(),
            "Ingestion finished"
        );
        report
    }

    /// Turn a source row into a request; `None` if it cannot be published
    fn prepare(&self, token: u64, row: Result<RawRecord, SourceError>) -> Option<PublishRequest> {
        let raw = match row {
            Ok(raw) => raw,
            Err(e) => {
                warn!(row = token, error = %e, "Unreadable row");
                return None;
            }
        };

        let record = match normalize(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(row = token, error = %e, "Row failed normalization");
                return None;
            }
        };

        match self.encoder.encode(&record) {
            Ok(payload) => Some(PublishRequest {
                topic: self.config.topic.clone(),
                key: record.entity_id,
                payload,
                token,
            }),
            Err(e) => {
                warn!(row = token, error = %e, "Row failed encoding");
                None
            }
        }
    }

    async fn submit(&mut self, mut request: PublishRequest, acc: &mut RunAccounting) {
        let mut retries_left = self.config.enqueue_retries;
        loop {
            let token = request.token;
            let key = request.key.clone();
            match self.publisher.enqueue(request) {
                Ok(()) => {
                    acc.sent += 1;
                    self.ledger.track(token, key);
                    return;
                }
                Err(rejected) if rejected.error.is_backpressure() && retries_left > 0 => {
                    retries_left -= 1;
                    debug!(row = token, retries_left, "Queue full, pumping before retry");
                    self.publisher.pump(&mut self.ledger);
                    tokio::task::yield_now().await;
                    request = rejected.request;
                }
                Err(rejected) => {
                    warn!(row = token, key = %key, error = %rejected.error, "Enqueue rejected");
                    acc.enqueue_rejected += 1;
                    return;
                }
            }
        }
    }

    fn report_progress(&mut self, acc: &RunAccounting) {
        let progress = Progress {
            total_seen: acc.total_seen,
            sent: acc.sent,
            acknowledged: self.ledger.acknowledged(),
            failed: acc.normalization_failed + acc.enqueue_rejected + self.ledger.failed(),
        };
        info!(
            seen = progress.total_seen,
            sent = progress.sent,
            acknowledged = progress.acknowledged,
            failed = progress.failed,
            "Progress"
        );
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&progress);
        }
    }
}
