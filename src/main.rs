//! anomflow - streaming anomaly detection over a line-delimited JSON bus.
//!
//! # Usage
//!
//! ```bash
//! # Replay a historical event stream
//! cat events.jsonl | anomflow --config anomflow.toml > anomalies.jsonl
//!
//! # Realtime mode with a 5s expiration sweep
//! tail -f events.jsonl | anomflow --config anomflow.toml --flush-interval 5
//! ```
//!
//! Inbound events arrive on stdin, one JSON object per line; every emission
//! (rulings, spans, bins) leaves on stdout the same way. Malformed lines
//! are logged and skipped.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Logging level (default: info)

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use anomflow::ingress::Extractor;
use anomflow::pipeline::{BusSink, Pipeline};
use anomflow::types::BusMessage;
use anomflow::PipelineConfig;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "anomflow")]
#[command(about = "Streaming anomaly detection for labeled time-series events")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML pipeline configuration
    #[arg(short, long, default_value = "anomflow.toml")]
    config: PathBuf,

    /// Seconds between expiration sweeps (realtime mode only)
    #[arg(long, default_value = "5")]
    flush_interval: u64,
}

// ============================================================================
// Stdout Sink
// ============================================================================

/// Publishes outbound messages as JSON lines on stdout.
struct StdoutSink;

#[async_trait]
impl BusSink for StdoutSink {
    async fn publish(&self, msg: BusMessage) -> Result<()> {
        let line = serde_json::to_string(&msg).context("could not encode outbound message")?;
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{line}").context("could not write to stdout")?;
        Ok(())
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    let config = PipelineConfig::load_from_path(&args.config)
        .with_context(|| format!("invalid config at {}", args.config.display()))?;
    let extractor = Extractor::new(&config.series_field, &config.value_field);

    let pipeline = Pipeline::start(&config, Arc::new(StdoutSink))?;
    let cancel = pipeline.cancellation_token();
    info!(
        realtime = config.realtime,
        shards = config.detect.max_procs,
        "pipeline started"
    );

    // Ctrl-C triggers the shared cancellation signal.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    // Realtime expiration sweeper: the host timer drives the gatherer.
    if config.realtime {
        if let Some(flush) = pipeline.flush_handle() {
            let cancel = cancel.clone();
            let period = std::time::Duration::from_secs(args.flush_interval.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => flush.flush_expired(Utc::now()).await,
                    }
                }
            });
        }
    }

    feed_stdin(&pipeline, extractor, &cancel).await;

    pipeline.shutdown().await;
    info!("pipeline drained");
    Ok(())
}

/// Read JSON-encoded bus events from stdin and feed them to the pipeline
/// until EOF or cancellation.
async fn feed_stdin(
    pipeline: &Pipeline,
    extractor: Extractor,
    cancel: &tokio_util::sync::CancellationToken,
) {
    let metrics = pipeline.metric_sender();
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    let mut line = String::with_capacity(2048);
    let mut events_read = 0u64;

    loop {
        line.clear();
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_line(&mut line) => match read {
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "stdin read failed");
                    break;
                }
            },
        };
        if bytes == 0 {
            info!(events_read, "input stream ended");
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: BusMessage = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "skipping malformed event");
                continue;
            }
        };
        events_read += 1;

        let metric = extractor.metric_from_message(&event);
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = metrics.send(metric) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
