//! Metric extraction from inbound bus events.
//!
//! The host bus delivers events as [`BusMessage`]s; this module pulls out
//! the three things the pipeline cares about: the series key, the numeric
//! value, and the passthrough fields. Extraction never fails — missing or
//! malformed fields fall back to defaults so a single bad event cannot
//! stall ingestion.

use crate::types::{BusMessage, Metric, DEFAULT_METRIC_VALUE, DEFAULT_SERIES};

/// Field-name configuration for extraction.
#[derive(Debug, Clone)]
pub struct Extractor {
    series_field: String,
    value_field: String,
}

impl Extractor {
    pub fn new(series_field: &str, value_field: &str) -> Self {
        Self {
            series_field: series_field.to_string(),
            value_field: value_field.to_string(),
        }
    }

    /// Convert an inbound event into a metric.
    pub fn metric_from_message(&self, msg: &BusMessage) -> Metric {
        Metric {
            timestamp: msg.timestamp(),
            series: self.series(msg),
            value: self.value(msg),
            passthrough: self.passthrough(msg),
        }
    }

    fn series(&self, msg: &BusMessage) -> String {
        if self.series_field.is_empty() {
            return DEFAULT_SERIES.to_string();
        }
        match msg.field(&self.series_field).and_then(|v| v.as_str()) {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => DEFAULT_SERIES.to_string(),
        }
    }

    fn value(&self, msg: &BusMessage) -> f64 {
        if self.value_field.is_empty() {
            return DEFAULT_METRIC_VALUE;
        }
        msg.field(&self.value_field)
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_METRIC_VALUE)
    }

    /// The series field is carried through to every downstream emission so
    /// consumers can re-join output events to their source stream.
    fn passthrough(&self, msg: &BusMessage) -> Vec<crate::types::MessageField> {
        msg.fields
            .iter()
            .filter(|f| !self.series_field.is_empty() && f.name == self.series_field)
            .cloned()
            .collect()
    }
}
