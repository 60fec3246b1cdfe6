//! Gatherer: groups consecutive anomalous rulings into anomalous spans.
//!
//! Rulings for one series open a span on the first anomalous verdict, feed
//! values into it while it stays warm, and flush it once `span_width`
//! seconds pass without an anomalous ruling. Non-anomalous rulings inside a
//! warm span contribute their value but do not extend the span's end, so a
//! span's tail is always an anomalous point.
//!
//! Expiration has two clocks. In replay mode the per-series `nows` table —
//! the last ruling end-time seen for that series — is the only clock, plus
//! a configured horizon (`last_date`) past which no more data can arrive.
//! In realtime mode the host drives a wall-clock sweeper through
//! [`flush_expired`](Gatherer::flush_expired) and the horizon check is
//! moot.
//!
//! The span and clock tables sit behind one mutex because the sweeper and
//! the ruling loop touch them concurrently. The lock is held only across
//! table updates; finalizing and emitting a span happens outside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{ConfigError, GatherConfig};
use crate::stats::Statistic;
use crate::types::{AnomalousSpan, Ruling};

/// Projects the configured value field out of a ruling.
pub type ValueProjection = fn(&Ruling) -> f64;

/// Dispatch map for `gather.value_field`. Unknown names are rejected at
/// init, so projection can never fail per-record.
fn projection_for(field: &str) -> Option<ValueProjection> {
    match field {
        "normed" => Some(|r| r.normed),
        "anomalousness" => Some(|r| r.anomalousness),
        "value" => Some(|r| r.window.value),
        _ => None,
    }
}

struct SpanCache {
    spans: HashMap<String, AnomalousSpan>,
    /// Last observed ruling end-time per series; the replay-mode clock.
    nows: HashMap<String, DateTime<Utc>>,
}

pub struct Gatherer {
    span_width: Duration,
    statistic: Statistic,
    project: ValueProjection,
    /// Horizon past which no more data can arrive. `None` in realtime mode,
    /// where the wall clock is the only authority.
    last_date: Option<DateTime<Utc>>,
    cache: Mutex<SpanCache>,
}

impl Gatherer {
    pub fn new(config: &GatherConfig, realtime: bool) -> Result<Self, ConfigError> {
        if config.span_width <= 0 {
            return Err(ConfigError::SpanWidth);
        }
        let project = projection_for(&config.value_field)
            .ok_or_else(|| ConfigError::UnknownValueField(config.value_field.clone()))?;
        let last_date = if realtime {
            None
        } else {
            Some(config.resolve_last_date()?)
        };
        Ok(Self {
            span_width: Duration::seconds(config.span_width),
            statistic: config.statistic,
            project,
            last_date,
            cache: Mutex::new(SpanCache {
                spans: HashMap::new(),
                nows: HashMap::new(),
            }),
        })
    }

    fn expired(&self, span: &AnomalousSpan, at: DateTime<Utc>) -> bool {
        let expires = span.end + self.span_width;
        if at > expires {
            return true;
        }
        // Past the horizon no ruling can arrive to close the span normally.
        self.last_date.is_some_and(|horizon| expires >= horizon)
    }

    fn open_span(ruling: &Ruling, value: f64) -> AnomalousSpan {
        AnomalousSpan {
            start: ruling.window.start,
            end: ruling.window.end,
            series: ruling.window.series.clone(),
            values: vec![value],
            aggregation: 0.0,
            duration_secs: 0,
            score: 0.0,
            passthrough: ruling.window.passthrough.clone(),
        }
    }

    /// Feed one ruling through the state machine. Returns the span this
    /// ruling flushed, if any, already finalized.
    pub fn observe(&self, ruling: &Ruling) -> Option<AnomalousSpan> {
        let series = &ruling.window.series;
        let t = ruling.window.end;
        let value = (self.project)(ruling);

        let flushed = {
            let mut cache = self.cache.lock().expect("span cache lock poisoned");
            cache.nows.insert(series.clone(), t);
            let state = cache.spans.get(series).map(|span| self.expired(span, t));
            match state {
                // Warm span: feed the value; only anomalous rulings extend
                // the end.
                Some(false) => {
                    if let Some(span) = cache.spans.get_mut(series) {
                        span.values.push(value);
                        if ruling.anomalous {
                            span.end = t;
                        }
                    }
                    None
                }
                // Expired span: flush it, and reopen at this ruling if it
                // is itself anomalous.
                Some(true) => {
                    let flushed = cache.spans.remove(series);
                    if ruling.anomalous {
                        cache
                            .spans
                            .insert(series.clone(), Self::open_span(ruling, value));
                    } else {
                        cache.nows.remove(series);
                    }
                    flushed
                }
                // No span: only an anomalous ruling opens one.
                None => {
                    if ruling.anomalous {
                        cache
                            .spans
                            .insert(series.clone(), Self::open_span(ruling, value));
                    }
                    None
                }
            }
        };

        flushed.and_then(|span| self.finalize(span))
    }

    /// Flush every span expired as of `now`. Callable from outside the
    /// ruling loop; the realtime sweeper drives this with wall-clock time.
    pub fn flush_expired(&self, now: DateTime<Utc>) -> Vec<AnomalousSpan> {
        let drained: Vec<AnomalousSpan> = {
            let mut cache = self.cache.lock().expect("span cache lock poisoned");
            let expired: Vec<String> = cache
                .spans
                .iter()
                .filter(|(_, span)| self.expired(span, now))
                .map(|(series, _)| series.clone())
                .collect();
            expired
                .iter()
                .filter_map(|series| {
                    cache.nows.remove(series);
                    cache.spans.remove(series)
                })
                .collect()
        };
        drained
            .into_iter()
            .filter_map(|span| self.finalize(span))
            .collect()
    }

    /// Drain every open span regardless of expiry. Used at end of input in
    /// replay mode, when the stream itself is the horizon.
    pub fn flush_all(&self) -> Vec<AnomalousSpan> {
        let drained: Vec<AnomalousSpan> = {
            let mut cache = self.cache.lock().expect("span cache lock poisoned");
            cache.nows.clear();
            cache.spans.drain().map(|(_, span)| span).collect()
        };
        drained
            .into_iter()
            .filter_map(|span| self.finalize(span))
            .collect()
    }

    /// Compute the derived fields and drop spans with nothing to score.
    fn finalize(&self, mut span: AnomalousSpan) -> Option<AnomalousSpan> {
        span.values = trim_trailing_zeros(span.values);
        let aggregation = match self.statistic.apply(&span.values) {
            Ok(v) => v,
            Err(err) => {
                warn!(series = %span.series, error = %err,
                    "dropping span with no scoreable values");
                return None;
            }
        };
        span.aggregation = aggregation;
        span.duration_secs = (span.end - span.start).num_seconds();
        span.score = span.duration_secs as f64 * aggregation;
        Some(span)
    }

    /// Run the ruling loop until input closes or cancellation. With
    /// `flush_remaining` (replay mode), drains all open spans after the
    /// input ends.
    pub async fn run(
        self: Arc<Self>,
        mut input: mpsc::Receiver<Ruling>,
        output: mpsc::Sender<AnomalousSpan>,
        cancel: CancellationToken,
        flush_remaining: bool,
    ) {
        loop {
            let ruling = tokio::select! {
                _ = cancel.cancelled() => return,
                ruling = input.recv() => match ruling {
                    Some(r) => r,
                    None => break,
                },
            };

            if let Some(span) = self.observe(&ruling) {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = output.send(span) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        if flush_remaining {
            for span in self.flush_all() {
                if output.send(span).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Drop zeros from the tail of `values`, preserving interior zeros
/// sandwiched between non-zero entries.
fn trim_trailing_zeros(values: Vec<f64>) -> Vec<f64> {
    let mut keep = false;
    let mut trimmed: Vec<f64> = values
        .into_iter()
        .rev()
        .filter(|v| {
            if *v != 0.0 {
                keep = true;
            }
            keep
        })
        .collect();
    trimmed.reverse();
    trimmed
}

// ============================================================================
// Tests
// ============================================================================
