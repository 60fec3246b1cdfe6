//! anomflow: streaming anomaly detection for labeled numeric time-series
//! events.
//!
//! ## Architecture
//!
//! - **Ingress**: extracts `Metric`s from inbound bus events
//! - **Windower**: condenses metrics into fixed-width per-series buckets
//! - **Detector**: scores windows with a seasonality-aware kernel, sharded
//!   across a worker pool keyed by series identity
//! - **Gatherer**: coalesces consecutive anomalous rulings into scored
//!   anomalous spans, with timer- or replay-driven expiration
//! - **Binner**: optional fixed-width histogram over the span stream
//!
//! Stages run as tokio tasks wired with bounded channels; see
//! [`pipeline::Pipeline`] for assembly and shutdown semantics.

pub mod binner;
pub mod config;
pub mod detect;
pub mod gather;
pub mod ingress;
pub mod pipeline;
pub mod stats;
pub mod types;
pub mod window;

// Re-export the types most callers touch
pub use config::{ConfigError, PipelineConfig};
pub use ingress::Extractor;
pub use pipeline::{BusSink, FlushHandle, Pipeline};
pub use stats::Statistic;
pub use types::{AnomalousSpan, Bin, BusMessage, Metric, Ruling, ToBusMessage, Window};
