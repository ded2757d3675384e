//! CLI entry point for the breadcrumb pipeline.
//!
//! Provides subcommands for running an ingest session over newline-delimited
//! JSON payloads (with promotion and an optional quality report) and for
//! running ad hoc quality checks over a CSV export.

use anyhow::{Context, Result, ensure};
use breadcrumb_pipeline::buffer::BreadcrumbBuffer;
use breadcrumb_pipeline::config::PipelineConfig;
use breadcrumb_pipeline::notify;
use breadcrumb_pipeline::promote::{Promoter, PromotionSummary};
use breadcrumb_pipeline::quality::{self, Dataset, QualityTester};
use breadcrumb_pipeline::store::MemoryStore;
use breadcrumb_pipeline::subscriber::{IngestSummary, Subscriber};
use breadcrumb_pipeline::transport::{ChannelTransport, Publisher};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// How many payloads the replay publisher may buffer ahead of the workers.
const PUBLISH_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "breadcrumb_pipeline")]
#[command(about = "Vehicle breadcrumb ingestion and promotion pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest newline-delimited JSON payloads, then promote them
    Ingest(IngestArgs),
    /// Run ad hoc quality checks over a CSV export
    Check(CheckArgs),
}

#[derive(Args)]
struct IngestArgs {
    /// Payload file to replay, or "-" for stdin
    #[arg(value_name = "FILE", default_value = "-")]
    source: String,

    /// Write the post-promotion quality report to this CSV file
    #[arg(short = 'q', long, value_name = "PATH")]
    quality_report: Option<String>,

    /// Flush the buffer at this many records, overriding FLUSH_THRESHOLD
    #[arg(long, value_name = "RECORDS", value_parser = clap::value_parser!(u64).range(1..))]
    flush_threshold: Option<u64>,

    /// Stop pulling deliveries after this long, overriding DRAIN_TIMEOUT_SECS
    #[arg(long, value_name = "SECS")]
    drain_timeout_secs: Option<u64>,

    /// Delivery worker count, overriding WORKER_CONCURRENCY
    #[arg(long, value_name = "TASKS", value_parser = clap::value_parser!(u64).range(1..))]
    workers: Option<u64>,
}

#[derive(Args)]
struct CheckArgs {
    /// CSV file holding the dataset to check
    #[arg(value_name = "FILE")]
    dataset: String,

    /// Dataset name to report results under
    #[arg(long, default_value = "dataset")]
    name: String,

    /// Check a column for repeated values (repeatable)
    #[arg(long, value_name = "COLUMN")]
    unique: Vec<String>,

    /// Check for fully duplicated rows
    #[arg(long, default_value_t = false)]
    duplicates: bool,

    /// Check a numeric column for negative values (repeatable)
    #[arg(long, value_name = "COLUMN")]
    negative: Vec<String>,

    /// Check a column for nulls (repeatable)
    #[arg(long, value_name = "COLUMN")]
    missing: Vec<String>,

    /// Flag values at or above a bound, written COLUMN=VALUE (repeatable)
    #[arg(long, value_name = "COLUMN=VALUE")]
    threshold: Vec<String>,

    /// Bound the change between consecutive values, COLUMN=MAX_PCT
    #[arg(long, value_name = "COLUMN=MAX_PCT")]
    pct_change: Vec<String>,

    /// Check a text column against the service date format (repeatable)
    #[arg(long, value_name = "COLUMN")]
    malformed_dates: Vec<String>,

    /// Require a single distinct value in a date column (repeatable)
    #[arg(long, value_name = "COLUMN")]
    single_date: Vec<String>,

    /// Write results to this CSV file
    #[arg(long, value_name = "PATH")]
    report: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/breadcrumb_pipeline.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("breadcrumb_pipeline.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest(args) => run_ingest(args).await?,
        Commands::Check(args) => run_check(&args)?,
    }

    Ok(())
}

/// Runs one full pipeline pass: replay payloads through the transport, drain
/// the subscription, promote, and report.
#[tracing::instrument(skip(args), fields(source = %args.source))]
async fn run_ingest(args: IngestArgs) -> Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(v) = args.flush_threshold {
        config.flush_threshold = v as usize;
    }
    if let Some(secs) = args.drain_timeout_secs {
        config.drain_timeout = Duration::from_secs(secs);
    }
    if let Some(v) = args.workers {
        config.worker_concurrency = v as usize;
    }
    info!(
        flush_threshold = config.flush_threshold,
        drain_timeout_secs = config.drain_timeout.as_secs(),
        workers = config.worker_concurrency,
        "Pipeline configured"
    );

    let store = Arc::new(MemoryStore::with_tables(config.tables.clone()));
    let buffer = Arc::new(BreadcrumbBuffer::new(
        store.clone(),
        config.flush_threshold,
        config.reject_high_water,
    ));
    let (publisher, transport) = ChannelTransport::open(PUBLISH_CAPACITY);

    let reader = tokio::spawn(publish_lines(publisher, args.source));

    let subscriber = Subscriber::new(
        transport,
        buffer,
        config.drain_timeout,
        config.worker_concurrency,
    );
    let summary = subscriber.run().await?;
    // Closing the transport unblocks the reader if the deadline cut the
    // session short.
    drop(subscriber);
    reader.await.context("joining payload reader")??;

    let notifier = notify::for_channel(config.webhook_url.clone(), config.webhook_mention.clone());
    notify::send_report(notifier.as_ref(), &ingest_message(&summary)).await;

    let promotion = match Promoter::new(store.clone()).promote().await {
        Ok(promotion) => promotion,
        Err(e) => {
            notify::send_report(notifier.as_ref(), &format!("Promotion failed: {e:#}")).await;
            return Err(e);
        }
    };
    notify::send_report(notifier.as_ref(), &promotion_message(&promotion)).await;

    if let Some(path) = args.quality_report {
        let tester = quality::standard_battery(
            &quality::trip_dataset(&store.trip_rows()),
            &quality::breadcrumb_dataset(&store.breadcrumb_rows()),
        );
        tester.log_results();
        tester.write_csv(Path::new(&path))?;
    }

    Ok(())
}

/// Reads payload lines from a file or stdin and publishes them in order.
#[tracing::instrument(skip(publisher))]
async fn publish_lines(publisher: Publisher, source: String) -> Result<u64> {
    if source == "-" {
        publish_from(publisher, BufReader::new(tokio::io::stdin())).await
    } else {
        let file = tokio::fs::File::open(&source)
            .await
            .with_context(|| format!("opening payload file {source}"))?;
        publish_from(publisher, BufReader::new(file)).await
    }
}

async fn publish_from<R>(publisher: Publisher, reader: R) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut published = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if publisher.publish(Bytes::from(line)).await.is_err() {
            warn!(
                published,
                "Subscriber stopped before the input was fully published"
            );
            return Ok(published);
        }
        published += 1;
    }
    info!(published, "Finished publishing payloads");
    Ok(published)
}

fn run_check(args: &CheckArgs) -> Result<()> {
    let dataset = Dataset::from_csv(&args.name, Path::new(&args.dataset))?;
    info!(
        dataset = %args.name,
        rows = dataset.len(),
        "Dataset loaded"
    );

    let mut tester = QualityTester::new();
    for column in &args.unique {
        tester.test_unique_column(&dataset, column);
    }
    if args.duplicates {
        tester.test_duplicate_rows(&dataset);
    }
    for column in &args.negative {
        tester.test_for_negative_values(&dataset, column);
    }
    for column in &args.missing {
        tester.test_for_missing_values(&dataset, column);
    }
    for pair in &args.threshold {
        let (column, bound) = split_column_bound(pair)?;
        tester.test_value_above_threshold(&dataset, &column, bound);
    }
    for pair in &args.pct_change {
        let (column, bound) = split_column_bound(pair)?;
        tester.test_for_percentage_difference(&dataset, &column, bound);
    }
    for column in &args.malformed_dates {
        tester.test_for_malformed_dates(&dataset, column);
    }
    for column in &args.single_date {
        tester.test_for_single_date(&dataset, column);
    }

    tester.log_results();
    if let Some(path) = &args.report {
        tester.write_csv(Path::new(path))?;
    }

    let (passed, failed, errored) = tester.outcome_counts();
    info!(passed, failed, errored, "Check run complete");
    ensure!(
        failed == 0 && errored == 0,
        "{failed} checks failed, {errored} errored"
    );
    Ok(())
}

fn split_column_bound(pair: &str) -> Result<(String, f64)> {
    let (column, bound) = pair
        .split_once('=')
        .with_context(|| format!("expected COLUMN=VALUE, got {pair:?}"))?;
    let bound: f64 = bound
        .parse()
        .with_context(|| format!("invalid numeric bound in {pair:?}"))?;
    Ok((column.to_string(), bound))
}

fn ingest_message(summary: &IngestSummary) -> String {
    format!(
        "Breadcrumbs received: {}\nAccepted: {}\nRejected: {}\nMalformed: {}\nStored rows: {}",
        summary.received, summary.accepted, summary.rejected, summary.malformed, summary.stored_rows
    )
}

fn promotion_message(promotion: &PromotionSummary) -> String {
    format!(
        "Promotion: {} rows selected, {} trips upserted, {} breadcrumbs inserted, {} duplicates skipped",
        promotion.selected, promotion.trips, promotion.inserted, promotion.skipped
    )
}
