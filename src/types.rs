//! Core data model for the anomaly pipeline.
//!
//! Each stage consumes one of these types and produces the next:
//! `Metric` -> `Window` -> `Ruling` -> `AnomalousSpan` -> `Bin`.
//! Stages exchange values over channels; nothing here is shared by
//! reference across stage boundaries.
//!
//! The bus codec lives here too: every emitted entity knows how to render
//! itself as a [`BusMessage`] for the host message bus, and `Window` can be
//! reconstructed from one (used by consumers that re-ingest window events).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Series key used when no series field is configured or present.
pub const DEFAULT_SERIES: &str = "**all**";

/// Metric value used when the value field is missing or unparseable.
pub const DEFAULT_METRIC_VALUE: f64 = 1.0;

// ============================================================================
// Bus Messages
// ============================================================================

/// A single named field on a bus message.
///
/// `unit` is a free-form annotation carried for downstream consumers
/// ("count", "date-time", "s", "json", or empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageField {
    pub name: String,
    pub value: FieldValue,
    #[serde(default)]
    pub unit: String,
}

/// Field payload. Inbound events may carry numeric values either as
/// strings or as native floats; both are accepted by the ingress parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Best-effort numeric view: native floats pass through, strings are
    /// parsed, booleans are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Str(s) => s.trim().parse().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A message on the host bus: a type tag, a nanosecond timestamp, and a bag
/// of named fields. Used for both inbound events and outbound emissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub tag: String,
    pub timestamp_ns: i64,
    #[serde(default)]
    pub fields: Vec<MessageField>,
}

impl BusMessage {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            timestamp_ns: 0,
            fields: Vec::new(),
        }
    }

    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        self.timestamp_ns = ts.timestamp_nanos_opt().unwrap_or_default();
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp_ns)
    }

    pub fn add_field(&mut self, name: &str, value: FieldValue, unit: &str) {
        self.fields.push(MessageField {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
        });
    }

    /// First field with the given name, if any.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }
}

/// Errors reconstructing an entity from a bus message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message does not contain '{0}' field")]
    MissingField(&'static str),
    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),
    #[error("could not parse '{field}' timestamp: {source}")]
    BadTimestamp {
        field: &'static str,
        source: chrono::ParseError,
    },
}

/// Render a timestamp the way the bus expects: RFC-3339 with nanoseconds.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str, field: &'static str) -> Result<DateTime<Utc>, MessageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| MessageError::BadTimestamp { field, source })
}

/// Implemented by every entity the pipeline publishes to the bus.
pub trait ToBusMessage {
    fn to_message(&self) -> BusMessage;
}

// ============================================================================
// Metric
// ============================================================================

/// One inbound data point, after field extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub timestamp: DateTime<Utc>,
    pub series: String,
    pub value: f64,
    /// Inbound fields carried verbatim through every downstream emission.
    pub passthrough: Vec<MessageField>,
}

// ============================================================================
// Window
// ============================================================================

/// A fixed-width time bucket aggregating the metrics of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub series: String,
    pub value: f64,
    pub passthrough: Vec<MessageField>,
}

impl Window {
    /// Seconds covered by this window.
    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// Write this window's fields onto a message (used by both the window
    /// tag and, prefixed, by rulings).
    pub fn fill_message(&self, msg: &mut BusMessage) {
        msg.set_timestamp(self.end);
        msg.add_field(
            "window_start",
            FieldValue::Str(format_timestamp(self.start)),
            "date-time",
        );
        msg.add_field(
            "window_end",
            FieldValue::Str(format_timestamp(self.end)),
            "date-time",
        );
        msg.add_field("series", FieldValue::Str(self.series.clone()), "");
        msg.add_field(
            "window_duration",
            FieldValue::Float(self.duration_secs() as f64),
            "s",
        );
        msg.add_field("value", FieldValue::Float(self.value), "count");
        for field in &self.passthrough {
            msg.fields.push(field.clone());
        }
    }

    /// Reconstruct a window from a bus message. The inverse of
    /// [`fill_message`](Window::fill_message) for the semantic fields
    /// (start, end, series, value); passthrough is not recovered.
    pub fn from_message(msg: &BusMessage) -> Result<Window, MessageError> {
        let start = msg
            .field("window_start")
            .ok_or(MessageError::MissingField("window_start"))?
            .as_str()
            .ok_or(MessageError::WrongType("window_start"))?;
        let end = msg
            .field("window_end")
            .ok_or(MessageError::MissingField("window_end"))?
            .as_str()
            .ok_or(MessageError::WrongType("window_end"))?;
        let series = msg
            .field("series")
            .ok_or(MessageError::MissingField("series"))?
            .as_str()
            .ok_or(MessageError::WrongType("series"))?;
        let value = msg
            .field("value")
            .ok_or(MessageError::MissingField("value"))?
            .as_f64()
            .ok_or(MessageError::WrongType("value"))?;

        Ok(Window {
            start: parse_timestamp(start, "window_start")?,
            end: parse_timestamp(end, "window_end")?,
            series: series.to_string(),
            value,
            passthrough: Vec::new(),
        })
    }
}

impl ToBusMessage for Window {
    fn to_message(&self) -> BusMessage {
        let mut msg = BusMessage::new("anom.window");
        self.fill_message(&mut msg);
        msg
    }
}

// ============================================================================
// Ruling
// ============================================================================

/// The detector's verdict on one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruling {
    pub window: Window,
    pub anomalous: bool,
    pub anomalousness: f64,
    pub normed: f64,
    pub passthrough: Vec<MessageField>,
}

impl ToBusMessage for Ruling {
    fn to_message(&self) -> BusMessage {
        let mut msg = BusMessage::new("anom.ruling");
        self.window.fill_message(&mut msg);
        msg.add_field("anomalous", FieldValue::Bool(self.anomalous), "");
        msg.add_field("anomalousness", FieldValue::Float(self.anomalousness), "count");
        msg.add_field("normed", FieldValue::Float(self.normed), "count");
        msg
    }
}

// ============================================================================
// Anomalous Span
// ============================================================================

/// A contiguous run of anomalous rulings for one series, summarized with an
/// aggregation statistic and a magnitude score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalousSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub series: String,
    pub values: Vec<f64>,
    pub aggregation: f64,
    pub duration_secs: i64,
    pub score: f64,
    pub passthrough: Vec<MessageField>,
}

impl ToBusMessage for AnomalousSpan {
    fn to_message(&self) -> BusMessage {
        let mut msg = BusMessage::new("anom.span");
        msg.set_timestamp(self.end);
        msg.add_field("series", FieldValue::Str(self.series.clone()), "");
        msg.add_field(
            "start",
            FieldValue::Str(format_timestamp(self.start)),
            "date-time",
        );
        msg.add_field(
            "end",
            FieldValue::Str(format_timestamp(self.end)),
            "date-time",
        );
        msg.add_field(
            "duration",
            FieldValue::Float(self.duration_secs as f64),
            "s",
        );
        msg.add_field("aggregation", FieldValue::Float(self.aggregation), "count");
        msg.add_field("score", FieldValue::Float(self.score), "count");
        // DOUBLE array, JSON-encoded for bus transport.
        let values = serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string());
        msg.add_field("values", FieldValue::Str(values), "json");
        for field in &self.passthrough {
            msg.fields.push(field.clone());
        }
        msg
    }
}

// ============================================================================
// Bin
// ============================================================================

/// A fixed-width histogram bucket counting the spans that overlap it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: i64,
    pub entries: Vec<String>,
}

impl ToBusMessage for Bin {
    fn to_message(&self) -> BusMessage {
        let mut msg = BusMessage::new("anom.bin");
        msg.set_timestamp(self.start);
        msg.add_field(
            "bin_start",
            FieldValue::Str(format_timestamp(self.start)),
            "date-time",
        );
        msg.add_field(
            "bin_end",
            FieldValue::Str(format_timestamp(self.end)),
            "date-time",
        );
        msg.add_field("count", FieldValue::Float(self.count as f64), "count");
        msg.add_field("series", FieldValue::Str(self.entries.join(", ")), "json");
        msg
    }
}

// ============================================================================
// Tests
// ============================================================================
