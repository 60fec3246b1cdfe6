//! Pipeline assembly: channels, stage tasks, fan-out, publication, and
//! orderly shutdown.
//!
//! ```text
//! metrics ─▶ Windower ─▶ Detector (router + N shards) ─▶ rulings
//!                                                           │
//!                                 ┌─────── broadcast ───────┤
//!                                 ▼                         ▼
//!                             Gatherer                ruling publisher
//!                                 │
//!                  ┌── broadcast ─┤  (when binning is on)
//!                  ▼              ▼
//!               Binner      span publisher
//!                  │
//!            bin publisher
//! ```
//!
//! Every channel is bounded, so a slow downstream stalls upstream
//! deterministically. Shutdown has two triggers: cancelling the shared
//! token stops every loop mid-stream, while closing the metric sender lets
//! the stages drain and terminate in dependency order as their inputs
//! close.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::binner::Binner;
use crate::config::{ConfigError, PipelineConfig};
use crate::detect;
use crate::gather::Gatherer;
use crate::types::{AnomalousSpan, BusMessage, Metric, ToBusMessage};
use crate::window::Windower;

/// Capacity of every inter-stage channel (detector shard queues have their
/// own, larger bound).
pub const CHANNEL_CAPACITY: usize = 100;

// ============================================================================
// Bus Sink
// ============================================================================

/// Outbound seam to the host message bus. Delivery is best-effort: a
/// rejected message is logged and dropped, never retried.
#[async_trait]
pub trait BusSink: Send + Sync + 'static {
    async fn publish(&self, msg: BusMessage) -> anyhow::Result<()>;
}

// ============================================================================
// Fan-out & Publication Tasks
// ============================================================================

/// One-to-many broadcaster. Closing the source closes all outputs; a
/// cancellation mid-send aborts and closes them too. An output whose
/// receiver is gone is skipped, the rest keep receiving.
async fn run_broadcast<T: Clone + Send + 'static>(
    mut input: mpsc::Receiver<T>,
    outputs: Vec<mpsc::Sender<T>>,
    cancel: CancellationToken,
) {
    loop {
        let value = tokio::select! {
            _ = cancel.cancelled() => return,
            value = input.recv() => match value {
                Some(v) => v,
                None => return,
            },
        };
        for output in &outputs {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _sent = output.send(value.clone()) => {}
            }
        }
    }
}

/// Lifts each emitted value onto the bus.
async fn run_publisher<T: ToBusMessage + Send + 'static>(
    mut input: mpsc::Receiver<T>,
    sink: Arc<dyn BusSink>,
    cancel: CancellationToken,
) {
    loop {
        let value = tokio::select! {
            _ = cancel.cancelled() => return,
            value = input.recv() => match value {
                Some(v) => v,
                None => return,
            },
        };
        let msg = value.to_message();
        let tag = msg.tag.clone();
        if let Err(err) = sink.publish(msg).await {
            warn!(tag = %tag, error = %err, "bus rejected outbound message, dropping");
        }
    }
}

// ============================================================================
// Flush Handle
// ============================================================================

/// Host-side handle for the realtime expiration sweeper. The host runs the
/// timer; each tick flushes expired spans into the normal span stream.
#[derive(Clone)]
pub struct FlushHandle {
    gatherer: Arc<Gatherer>,
    spans_tx: mpsc::Sender<AnomalousSpan>,
}

impl FlushHandle {
    pub async fn flush_expired(&self, now: DateTime<Utc>) {
        for span in self.gatherer.flush_expired(now) {
            if self.spans_tx.send(span).await.is_err() {
                break;
            }
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// A running pipeline. Feed metrics through
/// [`metric_sender`](Pipeline::metric_sender); call
/// [`shutdown`](Pipeline::shutdown) after dropping all sender clones to
/// let the stages drain.
pub struct Pipeline {
    metrics_tx: mpsc::Sender<Metric>,
    flush: Option<FlushHandle>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Pipeline {
    /// Validate the configuration, build every stage, and spawn the task
    /// graph. Nothing runs if any stage rejects its settings.
    pub fn start(config: &PipelineConfig, sink: Arc<dyn BusSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let (metrics_tx, metrics_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (windows_tx, windows_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let windower = Windower::new(&config.window)?;
        tasks.spawn(windower.run(metrics_rx, windows_tx, cancel.clone()));

        let (rulings_tx, rulings_rx) = mpsc::channel(CHANNEL_CAPACITY);
        detect::spawn(&config.detect, windows_rx, rulings_tx, &cancel, &mut tasks)?;

        let flush = if config.gather.disabled {
            // The pipeline ends at rulings.
            tasks.spawn(run_publisher(rulings_rx, Arc::clone(&sink), cancel.clone()));
            None
        } else {
            let (gather_tx, gather_rx) = mpsc::channel(CHANNEL_CAPACITY);
            let (ruling_pub_tx, ruling_pub_rx) = mpsc::channel(CHANNEL_CAPACITY);
            tasks.spawn(run_broadcast(
                rulings_rx,
                vec![gather_tx, ruling_pub_tx],
                cancel.clone(),
            ));
            tasks.spawn(run_publisher(
                ruling_pub_rx,
                Arc::clone(&sink),
                cancel.clone(),
            ));

            let gatherer = Arc::new(Gatherer::new(&config.gather, config.realtime)?);
            let (spans_tx, spans_rx) = mpsc::channel(CHANNEL_CAPACITY);
            // In replay mode the end of input is the horizon: drain every
            // open span once the ruling stream closes.
            let flush_remaining = !config.realtime;
            tasks.spawn(Arc::clone(&gatherer).run(
                gather_rx,
                spans_tx.clone(),
                cancel.clone(),
                flush_remaining,
            ));

            match &config.bin {
                Some(bin_config) => {
                    let binner = Binner::new(bin_config)?;
                    let (binner_tx, binner_rx) = mpsc::channel(CHANNEL_CAPACITY);
                    let (span_pub_tx, span_pub_rx) = mpsc::channel(CHANNEL_CAPACITY);
                    tasks.spawn(run_broadcast(
                        spans_rx,
                        vec![binner_tx, span_pub_tx],
                        cancel.clone(),
                    ));
                    tasks.spawn(run_publisher(
                        span_pub_rx,
                        Arc::clone(&sink),
                        cancel.clone(),
                    ));

                    let (bins_tx, bins_rx) = mpsc::channel(CHANNEL_CAPACITY);
                    tasks.spawn(binner.run(binner_rx, bins_tx, cancel.clone()));
                    tasks.spawn(run_publisher(bins_rx, Arc::clone(&sink), cancel.clone()));
                }
                None => {
                    tasks.spawn(run_publisher(spans_rx, Arc::clone(&sink), cancel.clone()));
                }
            }

            Some(FlushHandle { gatherer, spans_tx })
        };

        Ok(Self {
            metrics_tx,
            flush,
            cancel,
            tasks,
        })
    }

    /// A sender for feeding metrics in. Drop every clone to close ingress.
    pub fn metric_sender(&self) -> mpsc::Sender<Metric> {
        self.metrics_tx.clone()
    }

    /// Sweeper handle for realtime mode; `None` when gathering is disabled.
    pub fn flush_handle(&self) -> Option<FlushHandle> {
        self.flush.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal every stage to stop without draining.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close ingress and wait for every stage to terminate in dependency
    /// order.
    pub async fn shutdown(self) {
        let Pipeline {
            metrics_tx,
            flush,
            cancel: _cancel,
            mut tasks,
        } = self;
        drop(metrics_tx);
        drop(flush);
        while tasks.join_next().await.is_some() {}
    }
}

// ============================================================================
// Tests
// ============================================================================
