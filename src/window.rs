//! Windower: condenses the metric stream into fixed-width per-series
//! buckets.
//!
//! A pure transducer — one async task driven entirely by its input channel,
//! no internal concurrency, no timers. A window is flushed when a newer
//! metric for the same series lands outside it; the tail window of each
//! series is by construction partial and is discarded when the input
//! closes.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ConfigError, WindowConfig};
use crate::types::{Metric, Window};

pub struct Windower {
    width_secs: i64,
    current: HashMap<String, Window>,
}

impl Windower {
    pub fn new(config: &WindowConfig) -> Result<Self, ConfigError> {
        if config.window_width <= 0 {
            return Err(ConfigError::WindowWidth);
        }
        Ok(Self {
            width_secs: config.window_width,
            current: HashMap::new(),
        })
    }

    /// Fold one metric into its series' current window. Returns the
    /// finished window when the metric lands outside it.
    pub fn observe(&mut self, metric: Metric) -> Option<Window> {
        let window = self
            .current
            .entry(metric.series.clone())
            .or_insert_with(|| Window {
                start: metric.timestamp,
                end: metric.timestamp,
                series: metric.series.clone(),
                value: 0.0,
                passthrough: metric.passthrough.clone(),
            });

        let mut flushed = None;
        let age_secs = (metric.timestamp - window.start).num_seconds();
        if age_secs >= self.width_secs {
            flushed = Some(window.clone());
            window.start = metric.timestamp;
            window.end = metric.timestamp;
            window.value = 0.0;
            window.passthrough = metric.passthrough.clone();
        }

        window.value += metric.value;
        // Late metrics fold in without moving the window boundary backwards.
        if metric.timestamp > window.end {
            window.end = metric.timestamp;
        }
        flushed
    }

    /// Run until the input closes or cancellation fires.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Metric>,
        output: mpsc::Sender<Window>,
        cancel: CancellationToken,
    ) {
        loop {
            let metric = tokio::select! {
                _ = cancel.cancelled() => break,
                metric = input.recv() => match metric {
                    Some(m) => m,
                    None => break,
                },
            };

            if let Some(window) = self.observe(metric) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = output.send(window) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!(
            open_windows = self.current.len(),
            "windower stopped, discarding partial tail windows"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldValue, MessageField};
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn metric(t: i64, series: &str, value: f64) -> Metric {
        Metric {
            timestamp: ts(t),
            series: series.to_string(),
            value,
            passthrough: Vec::new(),
        }
    }

    fn windower(width: i64) -> Windower {
        Windower::new(&WindowConfig {
            window_width: width,
        })
        .unwrap()
    }

    #[test]
    fn rejects_nonpositive_width() {
        assert!(Windower::new(&WindowConfig { window_width: 0 }).is_err());
        assert!(Windower::new(&WindowConfig { window_width: -5 }).is_err());
    }

    #[test]
    fn flushes_when_a_metric_lands_outside_the_window() {
        let mut w = windower(10);
        assert!(w.observe(metric(0, "A", 1.0)).is_none());
        assert!(w.observe(metric(3, "A", 2.0)).is_none());

        let flushed = w.observe(metric(10, "A", 5.0)).unwrap();
        assert_eq!(flushed.start, ts(0));
        assert_eq!(flushed.end, ts(3));
        assert_eq!(flushed.value, 3.0);

        // The new current window holds only the triggering metric.
        let current = w.current.get("A").unwrap();
        assert_eq!(current.start, ts(10));
        assert_eq!(current.end, ts(10));
        assert_eq!(current.value, 5.0);
    }

    #[test]
    fn series_are_windowed_independently() {
        let mut w = windower(10);
        w.observe(metric(0, "A", 1.0));
        w.observe(metric(5, "B", 2.0));
        // B's window started at t=5, so t=12 is still inside it.
        assert!(w.observe(metric(12, "B", 1.0)).is_none());
        // A's window started at t=0, so t=12 flushes it.
        let flushed = w.observe(metric(12, "A", 1.0)).unwrap();
        assert_eq!(flushed.series, "A");
        assert_eq!(flushed.value, 1.0);
    }

    #[test]
    fn emitted_windows_are_ordered_and_disjoint_per_series() {
        let mut w = windower(10);
        let mut flushed = Vec::new();
        for t in (0..100).step_by(5) {
            if let Some(win) = w.observe(metric(t, "A", 1.0)) {
                flushed.push(win);
            }
        }
        for pair in flushed.windows(2) {
            assert!(pair[0].end < pair[1].start);
        }
        // Each flushed window summed two metrics of value 1.
        assert!(flushed.iter().all(|win| win.value == 2.0));
    }

    #[test]
    fn late_metric_folds_into_current_window() {
        let mut w = windower(10);
        w.observe(metric(20, "A", 1.0));
        // Strictly older than the window start: silently folded.
        assert!(w.observe(metric(15, "A", 4.0)).is_none());
        let current = w.current.get("A").unwrap();
        assert_eq!(current.value, 5.0);
        assert_eq!(current.start, ts(20));
        assert_eq!(current.end, ts(20));
    }

    #[test]
    fn passthrough_inherited_from_first_metric_of_the_bucket() {
        let mut w = windower(10);
        let mut m = metric(0, "A", 1.0);
        m.passthrough = vec![MessageField {
            name: "url".to_string(),
            value: FieldValue::Str("/home".to_string()),
            unit: String::new(),
        }];
        w.observe(m);
        let flushed = w.observe(metric(10, "A", 1.0)).unwrap();
        assert_eq!(flushed.passthrough.len(), 1);
        assert_eq!(flushed.passthrough[0].name, "url");
    }

    #[tokio::test]
    async fn run_discards_tail_window_on_close() {
        let (metric_tx, metric_rx) = mpsc::channel(8);
        let (window_tx, mut window_rx) = mpsc::channel(8);
        let task = tokio::spawn(windower(10).run(
            metric_rx,
            window_tx,
            CancellationToken::new(),
        ));

        metric_tx.send(metric(0, "A", 1.0)).await.unwrap();
        metric_tx.send(metric(10, "A", 2.0)).await.unwrap();
        drop(metric_tx);
        task.await.unwrap();

        // One full window flushed; the tail (value 2.0) discarded.
        let flushed = window_rx.recv().await.unwrap();
        assert_eq!(flushed.value, 1.0);
        assert!(window_rx.recv().await.is_none());
    }
}
