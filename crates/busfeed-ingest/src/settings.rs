//! Environment-driven settings

use crate::driver::{DriverConfig, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_PUMP_INTERVAL, DEFAULT_TOPIC};
use crate::publisher::{CompressionType, PublisherConfig};
use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Settings Constants
// ============================================================================

/// Default CSV source, relative to the working directory.
pub const DEFAULT_SOURCE_FILE: &str = "data/samples/sample_quick_test.csv";

/// Default partitions per topic in the in-process log used by dry runs.
pub const DEFAULT_DRY_RUN_PARTITIONS: u32 = 3;

/// Environment variable names
pub mod vars {
    pub const SOURCE_FILE: &str = "BUSFEED_SOURCE_FILE";
    pub const TOPIC: &str = "BUSFEED_TOPIC";
    pub const MAX_RECORDS: &str = "BUSFEED_MAX_RECORDS";
    pub const PUMP_INTERVAL: &str = "BUSFEED_PUMP_INTERVAL";
    pub const DRAIN_TIMEOUT_SECS: &str = "BUSFEED_DRAIN_TIMEOUT_SECS";
    pub const ENQUEUE_RETRIES: &str = "BUSFEED_ENQUEUE_RETRIES";
    pub const DRY_RUN_PARTITIONS: &str = "BUSFEED_DRY_RUN_PARTITIONS";

    pub const BOOTSTRAP_SERVERS: &str = "BUSFEED_BOOTSTRAP_SERVERS";
    pub const CLIENT_ID: &str = "BUSFEED_CLIENT_ID";
    pub const ACKS: &str = "BUSFEED_ACKS";
    pub const IDEMPOTENT: &str = "BUSFEED_IDEMPOTENT";
    pub const MAX_IN_FLIGHT: &str = "BUSFEED_MAX_IN_FLIGHT";
    pub const RETRIES: &str = "BUSFEED_RETRIES";
    pub const RETRY_BACKOFF_MS: &str = "BUSFEED_RETRY_BACKOFF_MS";
    pub const LINGER_MS: &str = "BUSFEED_LINGER_MS";
    pub const BATCH_SIZE: &str = "BUSFEED_BATCH_SIZE";
    pub const COMPRESSION: &str = "BUSFEED_COMPRESSION";
    pub const MESSAGE_TIMEOUT_MS: &str = "BUSFEED_MESSAGE_TIMEOUT_MS";
    pub const DELIVERY_TIMEOUT_MS: &str = "BUSFEED_DELIVERY_TIMEOUT_MS";
    pub const QUEUE_MAX_MESSAGES: &str = "BUSFEED_QUEUE_MAX_MESSAGES";
}

/// Everything a run needs, before command-line overrides
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub source_file: PathBuf,
    pub driver: DriverConfig,
    pub publisher: PublisherConfig,
    pub dry_run_partitions: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            source_file: PathBuf::from(DEFAULT_SOURCE_FILE),
            driver: DriverConfig::default(),
            publisher: PublisherConfig::default(),
            dry_run_partitions: DEFAULT_DRY_RUN_PARTITIONS,
        }
    }
}

impl IngestSettings {
    /// Load `.env`, then `BUSFEED_*` variables over the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    ///
    /// Unset variables take their defaults; set but malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let publisher = PublisherConfig {
            bootstrap_servers: get(vars::BOOTSTRAP_SERVERS)
                .unwrap_or(defaults.publisher.bootstrap_servers),
            client_id: get(vars::CLIENT_ID).unwrap_or(defaults.publisher.client_id),
            acks: parse(vars::ACKS, get(vars::ACKS))?.unwrap_or(defaults.publisher.acks),
            idempotent: parse(vars::IDEMPOTENT, get(vars::IDEMPOTENT))?
                .unwrap_or(defaults.publisher.idempotent),
            max_in_flight: parse(vars::MAX_IN_FLIGHT, get(vars::MAX_IN_FLIGHT))?
                .unwrap_or(defaults.publisher.max_in_flight),
            max_retries: parse(vars::RETRIES, get(vars::RETRIES))?
                .unwrap_or(defaults.publisher.max_retries),
            retry_backoff: millis(vars::RETRY_BACKOFF_MS, get(vars::RETRY_BACKOFF_MS))?
                .unwrap_or(defaults.publisher.retry_backoff),
            linger: millis(vars::LINGER_MS, get(vars::LINGER_MS))?
                .unwrap_or(defaults.publisher.linger),
            batch_size_bytes: parse(vars::BATCH_SIZE, get(vars::BATCH_SIZE))?
                .unwrap_or(defaults.publisher.batch_size_bytes),
            compression: parse::<CompressionType>(vars::COMPRESSION, get(vars::COMPRESSION))?
                .unwrap_or(defaults.publisher.compression),
            message_timeout: millis(vars::MESSAGE_TIMEOUT_MS, get(vars::MESSAGE_TIMEOUT_MS))?
                .unwrap_or(defaults.publisher.message_timeout),
            delivery_timeout: millis(vars::DELIVERY_TIMEOUT_MS, get(vars::DELIVERY_TIMEOUT_MS))?
                .unwrap_or(defaults.publisher.delivery_timeout),
            queue_max_messages: parse(vars::QUEUE_MAX_MESSAGES, get(vars::QUEUE_MAX_MESSAGES))?
                .unwrap_or(defaults.publisher.queue_max_messages),
            ..defaults.publisher
        };

        let driver = DriverConfig {
            topic: get(vars::TOPIC).unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            max_records: parse(vars::MAX_RECORDS, get(vars::MAX_RECORDS))?,
            pump_interval: parse(vars::PUMP_INTERVAL, get(vars::PUMP_INTERVAL))?
                .unwrap_or(DEFAULT_PUMP_INTERVAL),
            drain_timeout: Duration::from_secs(
                parse(vars::DRAIN_TIMEOUT_SECS, get(vars::DRAIN_TIMEOUT_SECS))?
                    .unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS),
            ),
            enqueue_retries: parse(vars::ENQUEUE_RETRIES, get(vars::ENQUEUE_RETRIES))?
                .unwrap_or(0),
        };

        let settings = Self {
            source_file: get(vars::SOURCE_FILE)
                .map(PathBuf::from)
                .unwrap_or(defaults.source_file),
            driver,
            publisher,
            dry_run_partitions: parse(vars::DRY_RUN_PARTITIONS, get(vars::DRY_RUN_PARTITIONS))?
                .unwrap_or(defaults.dry_run_partitions),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.driver.topic.is_empty() {
            anyhow::bail!("Topic cannot be empty");
        }
        if self.driver.pump_interval == 0 {
            anyhow::bail!("Pump interval must be greater than 0");
        }
        if self.driver.drain_timeout.is_zero() {
            anyhow::bail!("Drain timeout must be greater than 0");
        }
        if self.dry_run_partitions == 0 {
            anyhow::bail!("Dry-run partition count must be greater than 0");
        }
        self.publisher
            .validate()
            .context("Invalid publisher settings")?;
        Ok(())
    }
}

fn parse<T>(name: &str, value: Option<String>) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{}='{}' is invalid: {}", name, v, e))
        })
        .transpose()
}

fn millis(name: &str, value: Option<String>) -> anyhow::Result<Option<Duration>> {
    Ok(parse::<u64>(name, value)?.map(Duration::from_millis))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::publisher::Acks;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let settings = IngestSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.source_file, PathBuf::from(DEFAULT_SOURCE_FILE));
        assert_eq!(settings.driver.topic, "bus-gps-tracking");
        assert_eq!(settings.driver.max_records, None);
        assert_eq!(settings.driver.drain_timeout, Duration::from_secs(30));
        assert_eq!(settings.publisher.bootstrap_servers, "localhost:9092");
        assert!(settings.publisher.idempotent);
    }

    #[test]
    fn test_variables_override_defaults() {
        let settings = IngestSettings::from_lookup(lookup(&[
            (vars::TOPIC, "fleet-positions"),
            (vars::MAX_RECORDS, "100"),
            (vars::BOOTSTRAP_SERVERS, "kafka-1:9092,kafka-2:9092"),
            (vars::COMPRESSION, "gzip"),
            (vars::LINGER_MS, "20"),
            (vars::SOURCE_FILE, "/data/gps.csv"),
        ]))
        .unwrap();

        assert_eq!(settings.driver.topic, "fleet-positions");
        assert_eq!(settings.driver.max_records, Some(100));
        assert_eq!(settings.publisher.bootstrap_servers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(settings.publisher.compression, CompressionType::Gzip);
        assert_eq!(settings.publisher.linger, Duration::from_millis(20));
        assert_eq!(settings.source_file, PathBuf::from("/data/gps.csv"));
    }

    #[test]
    fn test_blank_variable_uses_default() {
        let settings = IngestSettings::from_lookup(lookup(&[(vars::TOPIC, "  ")])).unwrap();
        assert_eq!(settings.driver.topic, DEFAULT_TOPIC);
    }

    #[test]
    fn test_malformed_variable_is_error() {
        let err = IngestSettings::from_lookup(lookup(&[(vars::MAX_RECORDS, "lots")])).unwrap_err();
        assert!(err.to_string().contains(vars::MAX_RECORDS));
    }

    #[test]
    fn test_inconsistent_publisher_settings_rejected() {
        let result = IngestSettings::from_lookup(lookup(&[(vars::ACKS, "leader")]));
        assert!(result.is_err());

        let settings = IngestSettings::from_lookup(lookup(&[
            (vars::ACKS, "leader"),
            (vars::IDEMPOTENT, "false"),
        ]))
        .unwrap();
        assert_eq!(settings.publisher.acks, Acks::Leader);
    }
}
