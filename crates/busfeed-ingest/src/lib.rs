//! Busfeed Ingest Library
//!
//! Streams vehicle GPS telemetry from CSV files into a partitioned log service
//! with delivery tracking.
//!
//! # Pipeline
//!
//! - [`source`]: lazy CSV rows keyed by header name
//! - [`record`]: normalization into typed [`NormalizedRecord`]s
//! - [`encoder`]: payload serialization (compact JSON by default)
//! - [`publisher`]: flow-controlled, asynchronous publishing with delivery reports
//! - [`ledger`]: exactly-once resolution of delivery reports
//! - [`driver`]: the ingestion loop and its [`RunReport`]
//!
//! # Example
//!
//! ```no_run
//! use busfeed_ingest::driver::{DriverConfig, IngestionDriver};
//! use busfeed_ingest::publisher::{BufferedPublisher, MemoryLog, PublisherConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let log = Arc::new(MemoryLog::new(3));
//!     let publisher = BufferedPublisher::new(PublisherConfig::default(), log)?;
//!     let mut driver = IngestionDriver::new(publisher, DriverConfig::default());
//!
//!     let report = driver.ingest_file("data/samples/sample_quick_test.csv").await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod driver;
pub mod encoder;
pub mod ledger;
pub mod progress;
pub mod publisher;
pub mod record;
pub mod settings;
pub mod source;

pub use driver::{DriverConfig, IngestionDriver, RunAccounting, RunReport, Verdict};
pub use ledger::DeliveryLedger;
pub use record::{normalize, NormalizationError, NormalizedRecord, RawRecord};
pub use settings::IngestSettings;
pub use source::{CsvRowSource, SourceError};
