//! Busfeed Ingest - CSV to partitioned log publisher

use anyhow::{Context, Result};
use busfeed_common::logging::{init_logging, LogConfig, LogLevel};
use busfeed_common::BusfeedError;
use busfeed_ingest::driver::{IngestionDriver, RunReport, Verdict};
use busfeed_ingest::progress::{create_spinner, describe};
use busfeed_ingest::publisher::{BufferedPublisher, MemoryLog, Publisher};
use busfeed_ingest::settings::{vars, IngestSettings};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "busfeed-ingest")]
#[command(author, version, about = "Publish bus GPS telemetry from CSV to a partitioned log")]
struct Cli {
    /// CSV file to ingest
    #[arg(value_name = "FILE", env = vars::SOURCE_FILE)]
    file: Option<PathBuf>,

    /// Destination topic
    #[arg(short, long, env = vars::TOPIC)]
    topic: Option<String>,

    /// Stop after this many rows
    #[arg(short = 'n', long, env = vars::MAX_RECORDS)]
    max_records: Option<u64>,

    /// Log service addresses (host:port, comma separated)
    #[arg(short, long, env = vars::BOOTSTRAP_SERVERS)]
    bootstrap_servers: Option<String>,

    /// Seconds to wait for outstanding deliveries at the end of the run
    #[arg(long, value_name = "SECS", env = vars::DRAIN_TIMEOUT_SECS)]
    drain_timeout: Option<u64>,

    /// Publish to an in-process log instead of Kafka
    #[arg(long)]
    dry_run: bool,

    /// Report output format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,

    /// Hide the progress spinner
    #[arg(long)]
    no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("busfeed-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        }
    };

    let code = match execute(&cli).await {
        Ok(report) => {
            if let Err(e) = print_report(&report, cli.report) {
                error!(error = %e, "Could not render report");
            }
            i32::from(report.verdict() == Verdict::Failing)
        }
        Err(e) => {
            let source_failure = e
                .downcast_ref::<BusfeedError>()
                .is_some_and(BusfeedError::is_source_error);
            error!(error = %format!("{:#}", e), source_failure, "Ingestion failed");
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // Flush file logs before exiting
    drop(guard);
    process::exit(code);
}

async fn execute(cli: &Cli) -> Result<RunReport> {
    let mut settings = IngestSettings::from_env().context("Failed to load settings")?;

    if let Some(file) = &cli.file {
        settings.source_file = file.clone();
    }
    if let Some(topic) = &cli.topic {
        settings.driver.topic = topic.clone();
    }
    if cli.max_records.is_some() {
        settings.driver.max_records = cli.max_records;
    }
    if let Some(servers) = &cli.bootstrap_servers {
        settings.publisher.bootstrap_servers = servers.clone();
    }
    if let Some(secs) = cli.drain_timeout {
        settings.driver.drain_timeout = Duration::from_secs(secs);
    }
    settings.validate()?;

    info!(
        file = %settings.source_file.display(),
        topic = %settings.driver.topic,
        dry_run = cli.dry_run,
        "Starting busfeed ingest"
    );

    if cli.dry_run {
        let log = Arc::new(MemoryLog::new(settings.dry_run_partitions));
        let publisher = BufferedPublisher::new(settings.publisher.clone(), Arc::clone(&log))
            .map_err(BusfeedError::from)?;
        let report = ingest(publisher, &settings, !cli.no_progress).await?;

        for (partition, count) in log.partition_sizes(&settings.driver.topic).iter().enumerate() {
            info!(partition, messages = count, "Dry-run partition");
        }
        return Ok(report);
    }

    publish_to_kafka(&settings, !cli.no_progress).await
}

#[cfg(feature = "kafka")]
async fn publish_to_kafka(settings: &IngestSettings, show_progress: bool) -> Result<RunReport> {
    let publisher = busfeed_ingest::publisher::KafkaPublisher::new(&settings.publisher)
        .map_err(BusfeedError::from)?;
    ingest(publisher, settings, show_progress).await
}

#[cfg(not(feature = "kafka"))]
async fn publish_to_kafka(_settings: &IngestSettings, _show_progress: bool) -> Result<RunReport> {
    anyhow::bail!("built without Kafka support; rebuild with `--features kafka` or pass --dry-run")
}

async fn ingest<P: Publisher>(
    publisher: P,
    settings: &IngestSettings,
    show_progress: bool,
) -> Result<RunReport> {
    let mut driver = IngestionDriver::new(publisher, settings.driver.clone());

    let spinner = show_progress.then(|| create_spinner("Publishing"));
    if let Some(pb) = spinner.clone() {
        driver = driver.on_progress(move |progress| pb.set_message(describe(progress)));
    }

    let result = driver.ingest_file(&settings.source_file).await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    Ok(result.map_err(BusfeedError::from)?)
}

fn print_report(report: &RunReport, format: ReportFormat) -> busfeed_common::Result<()> {
    match format {
        ReportFormat::Text => println!("{}", report),
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}
