//! Delivery accounting
//!
//! The [`DeliveryLedger`] remembers every accepted message until its delivery
//! report arrives and resolves each one exactly once. Reports for tokens it never
//! tracked, or tracked and already resolved, are anomalies: logged and counted
//! but never folded into the acknowledged or failed totals.

use crate::publisher::{DeliveryHandler, DeliveryOutcome, DeliveryReport};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Snapshot of ledger counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub tracked: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub pending: u64,
    pub anomalies: u64,
}

#[derive(Debug, Default)]
pub struct DeliveryLedger {
    pending: HashMap<u64, String>,
    tracked: u64,
    acknowledged: u64,
    failed: u64,
    anomalies: u64,
    failures_by_kind: BTreeMap<&'static str, u64>,
    acked_by_key: HashMap<String, Vec<u64>>,
    total_latency: Duration,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted message awaiting its report.
    pub fn track(&mut self, token: u64, key: impl Into<String>) {
        if self.pending.insert(token, key.into()).is_some() {
            warn!(token, "Token tracked twice");
            self.anomalies += 1;
            return;
        }
        self.tracked += 1;
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Tracked messages still awaiting a report
    pub fn pending(&self) -> u64 {
        self.pending.len() as u64
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Failed deliveries grouped by [`DeliveryError::kind`](crate::publisher::DeliveryError::kind)
    pub fn failures_by_kind(&self) -> &BTreeMap<&'static str, u64> {
        &self.failures_by_kind
    }

    /// Tokens of `key` in the order their acknowledgments were served
    pub fn ack_order(&self, key: &str) -> &[u64] {
        self.acked_by_key.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mean enqueue-to-outcome latency over resolved messages
    pub fn mean_latency(&self) -> Option<Duration> {
        let resolved = self.acknowledged + self.failed;
        u32::try_from(resolved)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.total_latency / n)
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            tracked: self.tracked,
            acknowledged: self.acknowledged,
            failed: self.failed,
            pending: self.pending(),
            anomalies: self.anomalies,
        }
    }
}

impl DeliveryHandler for DeliveryLedger {
    fn on_delivery(&mut self, report: DeliveryReport) {
        let Some(key) = self.pending.remove(&report.token) else {
            warn!(
                token = report.token,
                key = %report.key,
                "Delivery report for unknown or already resolved token"
            );
            self.anomalies += 1;
            return;
        };

        self.total_latency += report.latency;
        match report.outcome {
            DeliveryOutcome::Acknowledged {
                partition, offset, ..
            } => {
                debug!(token = report.token, partition, offset, "Delivered");
                self.acknowledged += 1;
                self.acked_by_key.entry(key).or_default().push(report.token);
            }
            DeliveryOutcome::Failed(error) => {
                warn!(
                    token = report.token,
                    key = %key,
                    attempts = report.attempts,
                    error = %error,
                    "Delivery failed"
                );
                self.failed += 1;
                *self.failures_by_kind.entry(error.kind()).or_default() += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::publisher::DeliveryError;

    fn acked(token: u64, key: &str) -> DeliveryReport {
        DeliveryReport {
            token,
            key: key.into(),
            outcome: DeliveryOutcome::Acknowledged {
                topic: "bus-gps-tracking".into(),
                partition: 0,
                offset: token as i64,
            },
            attempts: 1,
            latency: Duration::from_millis(4),
        }
    }

    fn failed(token: u64, error: DeliveryError) -> DeliveryReport {
        DeliveryReport {
            token,
            key: "51B-001".into(),
            outcome: DeliveryOutcome::Failed(error),
            attempts: 2,
            latency: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_resolves_in_any_order() {
        let mut ledger = DeliveryLedger::new();
        for token in 0..4 {
            ledger.track(token, "51B-001");
        }

        ledger.on_delivery(acked(2, "51B-001"));
        ledger.on_delivery(failed(0, DeliveryError::Timeout));
        ledger.on_delivery(acked(3, "51B-001"));

        assert_eq!(
            ledger.stats(),
            LedgerStats {
                tracked: 4,
                acknowledged: 2,
                failed: 1,
                pending: 1,
                anomalies: 0,
            }
        );
        assert_eq!(ledger.ack_order("51B-001"), &[2, 3]);
        assert_eq!(ledger.failures_by_kind().get("timeout"), Some(&1));
    }

    #[test]
    fn test_duplicate_and_unknown_reports_are_anomalies() {
        let mut ledger = DeliveryLedger::new();
        ledger.track(1, "51B-001");

        ledger.on_delivery(acked(1, "51B-001"));
        ledger.on_delivery(acked(1, "51B-001"));
        ledger.on_delivery(acked(99, "51B-002"));

        assert_eq!(ledger.acknowledged(), 1);
        assert_eq!(ledger.failed(), 0);
        assert_eq!(ledger.anomalies(), 2);
        assert!(ledger.ack_order("51B-002").is_empty());
    }

    #[test]
    fn test_mean_latency() {
        let mut ledger = DeliveryLedger::new();
        assert_eq!(ledger.mean_latency(), None);

        ledger.track(1, "a");
        ledger.track(2, "b");
        ledger.on_delivery(acked(1, "a"));
        ledger.on_delivery(failed(2, DeliveryError::Rejected("too large".into())));

        assert_eq!(ledger.mean_latency(), Some(Duration::from_millis(7)));
    }
}
