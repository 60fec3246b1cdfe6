//! Binner: collapses the span stream into a fixed-width histogram.
//!
//! Each span increments every bin it overlaps, and a snapshot of the bin is
//! emitted per increment. Consumers therefore see a running-totals stream;
//! deduplicating on `(bin_start, count)` is their responsibility.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{BinConfig, ConfigError};
use crate::types::{AnomalousSpan, Bin};

pub struct Binner {
    width_secs: i64,
    /// Lazily created bins keyed by bucket start (unix seconds).
    bins: HashMap<i64, Bin>,
}

impl Binner {
    pub fn new(config: &BinConfig) -> Result<Self, ConfigError> {
        if config.bin_width <= 0 {
            return Err(ConfigError::BinWidth);
        }
        Ok(Self {
            width_secs: config.bin_width,
            bins: HashMap::new(),
        })
    }

    /// Bucket starts overlapped by a span, inclusive on both ends.
    fn buckets(&self, span: &AnomalousSpan) -> Vec<DateTime<Utc>> {
        let first = span.start.timestamp().div_euclid(self.width_secs) * self.width_secs;
        let mut buckets = Vec::new();
        let mut bucket = match Utc.timestamp_opt(first, 0).single() {
            Some(t) => t,
            None => return buckets,
        };
        while bucket <= span.end {
            buckets.push(bucket);
            bucket = bucket + Duration::seconds(self.width_secs);
        }
        buckets
    }

    /// Fold one span into the histogram; returns a snapshot per updated bin.
    pub fn observe(&mut self, span: &AnomalousSpan) -> Vec<Bin> {
        let mut snapshots = Vec::new();
        for bucket in self.buckets(span) {
            let bin = self.bins.entry(bucket.timestamp()).or_insert_with(|| Bin {
                start: bucket,
                end: bucket + Duration::seconds(self.width_secs),
                count: 0,
                entries: Vec::new(),
            });
            bin.count += 1;
            bin.entries.push(span.series.clone());
            snapshots.push(bin.clone());
        }
        snapshots
    }

    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<AnomalousSpan>,
        output: mpsc::Sender<Bin>,
        cancel: CancellationToken,
    ) {
        loop {
            let span = tokio::select! {
                _ = cancel.cancelled() => return,
                span = input.recv() => match span {
                    Some(s) => s,
                    None => return,
                },
            };

            for bin in self.observe(&span) {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = output.send(bin) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
