//! Detector stage: scores windows with a seasonality-aware anomaly kernel,
//! sharded across a fixed pool of workers.
//!
//! ## Sharding
//!
//! Each series is assigned to exactly one shard on first sighting and stays
//! there for the lifetime of the stage, so every shard sees its series'
//! windows in arrival order — the kernel's sliding history depends on that.
//! Assignment starts from a hash of the series key and probes forward past
//! shards whose queues are nearly full, which keeps hot series from piling
//! onto one lane without breaking stickiness.
//!
//! ## Warm-up and backfill
//!
//! A kernel needs `minor_frequency` windows of history before its scores
//! mean anything. Nothing is emitted while a series warms up; the moment
//! the history fills, the kernel runs once over the whole buffer and one
//! ruling is emitted per buffered window, oldest first. After that the
//! history slides and each new window produces exactly one ruling.

mod rpca;

pub use rpca::RpcaDetector;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Algorithm, ConfigError, DetectConfig, KernelConfig};
use crate::types::{Ruling, Window};

/// Bounded FIFO depth per shard. Blocking on a full queue is the intended
/// failure mode under sustained overload.
pub const SHARD_QUEUE_CAPACITY: usize = 10_000;

/// A shard whose queue is at or above this fill ratio is skipped when a new
/// series is assigned.
pub const SHARD_FULL_RATIO: f64 = 0.98;

// ============================================================================
// Kernel Seam
// ============================================================================

/// Per-window verdicts aligned with the input history: `anomalous[i]`,
/// `anomalousness[i]`, and `normed[i]` all describe `history[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub anomalous: Vec<bool>,
    pub anomalousness: Vec<f64>,
    pub normed: Vec<f64>,
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("history length {len} is not a multiple of the season length {period}")]
    HistoryNotPeriodAligned { len: usize, period: usize },
    #[error("history contains non-finite values")]
    NonFiniteInput,
    #[error("kernel output length {got} does not match history length {expected}")]
    MisalignedOutput { got: usize, expected: usize },
}

/// The injectable anomaly kernel. Implementations score a full history of
/// window values and return one verdict per element.
pub trait DetectAlgo: Send {
    fn detect(&mut self, history: &[f64]) -> Result<Detection, KernelError>;
}

fn build_kernel(
    algorithm: Algorithm,
    config: &KernelConfig,
) -> Result<Box<dyn DetectAlgo>, ConfigError> {
    match algorithm {
        Algorithm::Rpca => Ok(Box::new(RpcaDetector::new(config)?)),
    }
}

// ============================================================================
// Shard Worker
// ============================================================================

struct ShardWorker {
    shard: usize,
    kernel: Box<dyn DetectAlgo>,
    minor_period: usize,
    history: HashMap<String, Vec<Window>>,
    /// Series whose kernel failures have already been logged.
    failed_series: HashSet<String>,
}

impl ShardWorker {
    fn new(kernel: Box<dyn DetectAlgo>, minor_period: usize, shard: usize) -> Self {
        Self {
            shard,
            kernel,
            minor_period,
            history: HashMap::new(),
            failed_series: HashSet::new(),
        }
    }

    fn make_ruling(window: &Window, anomalous: bool, anomalousness: f64, normed: f64) -> Ruling {
        Ruling {
            passthrough: window.passthrough.clone(),
            window: window.clone(),
            anomalous,
            anomalousness,
            normed,
        }
    }

    /// Score one window, returning zero rulings (warm-up), a full backfill,
    /// or a single ruling for the newest point.
    fn score(&mut self, window: Window) -> Vec<Ruling> {
        let series = window.series.clone();
        let history = self.history.entry(series.clone()).or_default();
        history.push(window);

        if history.len() < self.minor_period {
            return Vec::new();
        }
        let backfill = history.len() == self.minor_period;
        if history.len() > self.minor_period {
            history.remove(0);
        }

        let values: Vec<f64> = history.iter().map(|w| w.value).collect();
        let result = self.kernel.detect(&values).and_then(|d| {
            if d.anomalous.len() != values.len()
                || d.anomalousness.len() != values.len()
                || d.normed.len() != values.len()
            {
                Err(KernelError::MisalignedOutput {
                    got: d.normed.len(),
                    expected: values.len(),
                })
            } else {
                Ok(d)
            }
        });
        let detection = match result {
            Ok(d) => d,
            Err(err) => {
                if self.failed_series.insert(series.clone()) {
                    warn!(series = %series, shard = self.shard, error = %err,
                        "kernel failed, scoring as non-anomalous");
                }
                Detection {
                    anomalous: vec![false; values.len()],
                    anomalousness: vec![0.0; values.len()],
                    normed: vec![0.0; values.len()],
                }
            }
        };

        if backfill {
            history
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    Self::make_ruling(
                        w,
                        detection.anomalous[i],
                        detection.anomalousness[i],
                        detection.normed[i],
                    )
                })
                .collect()
        } else {
            let i = values.len() - 1;
            history
                .last()
                .map(|w| {
                    Self::make_ruling(
                        w,
                        detection.anomalous[i],
                        detection.anomalousness[i],
                        detection.normed[i],
                    )
                })
                .into_iter()
                .collect()
        }
    }

    async fn run(
        mut self,
        mut input: mpsc::Receiver<Window>,
        output: mpsc::Sender<Ruling>,
        cancel: CancellationToken,
    ) {
        loop {
            let window = tokio::select! {
                _ = cancel.cancelled() => break,
                window = input.recv() => match window {
                    Some(w) => w,
                    None => break,
                },
            };

            for ruling in self.score(window) {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = output.send(ruling) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Shard Router
// ============================================================================

struct ShardRouter {
    queues: Vec<mpsc::Sender<Window>>,
    assignments: HashMap<String, usize>,
}

fn hash_index(series: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    series.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

impl ShardRouter {
    fn new(queues: Vec<mpsc::Sender<Window>>) -> Self {
        Self {
            queues,
            assignments: HashMap::new(),
        }
    }

    fn queue_is_full(&self, shard: usize) -> bool {
        let queue = &self.queues[shard];
        let max = queue.max_capacity();
        let fill = max - queue.capacity();
        fill as f64 >= SHARD_FULL_RATIO * max as f64
    }

    /// Sticky shard lookup. New series start from their hash slot and move
    /// past shards that are at least 98% full, wrapping at most once.
    fn shard_for(&mut self, series: &str) -> usize {
        if let Some(&shard) = self.assignments.get(series) {
            return shard;
        }
        let shards = self.queues.len();
        let mut shard = hash_index(series, shards);
        for _ in 0..shards {
            if !self.queue_is_full(shard) {
                break;
            }
            shard = (shard + 1) % shards;
        }
        self.assignments.insert(series.to_string(), shard);
        debug!(series = %series, shard, "assigned series to detector shard");
        shard
    }

    async fn run(mut self, mut input: mpsc::Receiver<Window>, cancel: CancellationToken) {
        loop {
            let window = tokio::select! {
                _ = cancel.cancelled() => break,
                window = input.recv() => match window {
                    Some(w) => w,
                    None => break,
                },
            };

            let shard = self.shard_for(&window.series);
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = self.queues[shard].send(window) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        // Dropping the queues lets the workers drain and exit.
    }
}

// ============================================================================
// Stage Assembly
// ============================================================================

/// Spawn the router plus `max_procs` shard workers onto `tasks`.
///
/// The rulings channel closes once the router has exited and every worker
/// has drained its queue, so downstream stages observe shutdown in
/// dependency order.
pub fn spawn(
    config: &DetectConfig,
    input: mpsc::Receiver<Window>,
    output: mpsc::Sender<Ruling>,
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Result<(), ConfigError> {
    if config.max_procs == 0 {
        return Err(ConfigError::MaxProcs);
    }
    config.kernel.validate()?;
    let minor_period = config.kernel.minor_frequency as usize;

    let mut queues = Vec::with_capacity(config.max_procs);
    for shard in 0..config.max_procs {
        let (tx, rx) = mpsc::channel(SHARD_QUEUE_CAPACITY);
        queues.push(tx);
        let kernel = build_kernel(config.algorithm, &config.kernel)?;
        let worker = ShardWorker::new(kernel, minor_period, shard);
        tasks.spawn(worker.run(rx, output.clone(), cancel.clone()));
    }
    drop(output);

    tasks.spawn(ShardRouter::new(queues).run(input, cancel.clone()));
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn window(t: i64, series: &str, value: f64) -> Window {
        Window {
            start: Utc.timestamp_opt(t, 0).unwrap(),
            end: Utc.timestamp_opt(t + 9, 0).unwrap(),
            series: series.to_string(),
            value,
            passthrough: Vec::new(),
        }
    }

    /// Kernel that flags every value above a fixed cut.
    struct ThresholdKernel {
        cut: f64,
    }

    impl DetectAlgo for ThresholdKernel {
        fn detect(&mut self, history: &[f64]) -> Result<Detection, KernelError> {
            Ok(Detection {
                anomalous: history.iter().map(|v| *v > self.cut).collect(),
                anomalousness: history.to_vec(),
                normed: history.iter().map(|v| v / self.cut).collect(),
            })
        }
    }

    struct FailingKernel;

    impl DetectAlgo for FailingKernel {
        fn detect(&mut self, _history: &[f64]) -> Result<Detection, KernelError> {
            Err(KernelError::NonFiniteInput)
        }
    }

    #[test]
    fn warm_up_emits_nothing_then_backfills() {
        let mut worker = ShardWorker::new(Box::new(ThresholdKernel { cut: 10.0 }), 4, 0);

        for t in 0..3 {
            assert!(worker.score(window(t * 10, "A", 1.0)).is_empty());
        }

        // Fourth window completes the history: one ruling per buffered
        // window, oldest first.
        let rulings = worker.score(window(30, "A", 99.0));
        assert_eq!(rulings.len(), 4);
        assert_eq!(rulings[0].window.start, Utc.timestamp_opt(0, 0).unwrap());
        assert!(!rulings[0].anomalous);
        assert!(rulings[3].anomalous);

        // Fifth window slides the history and emits exactly one ruling.
        let rulings = worker.score(window(40, "A", 2.0));
        assert_eq!(rulings.len(), 1);
        assert_eq!(rulings[0].window.start, Utc.timestamp_opt(40, 0).unwrap());
        assert!(!rulings[0].anomalous);
    }

    #[test]
    fn rulings_match_windows_after_warm_up() {
        let mut worker = ShardWorker::new(Box::new(ThresholdKernel { cut: 10.0 }), 4, 0);
        let mut emitted = 0;
        for t in 0..20 {
            emitted += worker.score(window(t * 10, "A", 1.0)).len();
        }
        // 20 windows in, 20 rulings out (warm-up debt repaid by backfill).
        assert_eq!(emitted, 20);
    }

    #[test]
    fn series_warm_up_independently() {
        let mut worker = ShardWorker::new(Box::new(ThresholdKernel { cut: 10.0 }), 2, 0);
        assert!(worker.score(window(0, "A", 1.0)).is_empty());
        assert!(worker.score(window(0, "B", 1.0)).is_empty());
        assert_eq!(worker.score(window(10, "A", 1.0)).len(), 2);
        assert_eq!(worker.score(window(10, "B", 1.0)).len(), 2);
    }

    #[test]
    fn kernel_failure_scores_as_non_anomalous() {
        let mut worker = ShardWorker::new(Box::new(FailingKernel), 2, 0);
        assert!(worker.score(window(0, "A", 1.0)).is_empty());
        let rulings = worker.score(window(10, "A", 5.0));
        assert_eq!(rulings.len(), 2);
        for ruling in &rulings {
            assert!(!ruling.anomalous);
            assert_eq!(ruling.anomalousness, 0.0);
            assert_eq!(ruling.normed, 0.0);
        }
    }

    #[test]
    fn shard_assignment_is_sticky() {
        let queues: Vec<_> = (0..4).map(|_| mpsc::channel(8).0).collect();
        let mut router = ShardRouter::new(queues);
        let first = router.shard_for("web.requests");
        for _ in 0..10 {
            assert_eq!(router.shard_for("web.requests"), first);
        }
    }

    #[test]
    fn assignment_starts_from_the_hash_slot() {
        let queues: Vec<_> = (0..4).map(|_| mpsc::channel(8).0).collect();
        let mut router = ShardRouter::new(queues);
        assert_eq!(router.shard_for("api.errors"), hash_index("api.errors", 4));
    }

    #[tokio::test]
    async fn full_shard_is_probed_past() {
        // Two shards with capacity 1; stuff the hash-preferred shard so the
        // fill check sees it at 100%.
        let (tx0, _rx0) = mpsc::channel(1);
        let (tx1, _rx1) = mpsc::channel(1);
        let queues = vec![tx0, tx1];
        let preferred = hash_index("hot.series", 2);
        queues[preferred].send(window(0, "x", 0.0)).await.unwrap();

        let mut router = ShardRouter::new(queues);
        assert_eq!(router.shard_for("hot.series"), 1 - preferred);
    }

    #[tokio::test]
    async fn stage_closes_rulings_after_draining() {
        let config = DetectConfig {
            algorithm: Algorithm::Rpca,
            max_procs: 2,
            kernel: KernelConfig {
                major_frequency: 2,
                minor_frequency: 4,
                autodiff: false,
            },
        };
        let (window_tx, window_rx) = mpsc::channel(16);
        let (ruling_tx, mut ruling_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        spawn(&config, window_rx, ruling_tx, &cancel, &mut tasks).unwrap();

        for t in 0..8 {
            window_tx.send(window(t * 10, "A", 1.0)).await.unwrap();
        }
        drop(window_tx);

        let mut count = 0;
        while ruling_rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 8);
        while tasks.join_next().await.is_some() {}
    }
}
