//! Aggregation statistics for span scoring.
//!
//! The gatherer collapses a span's constituent values into a single number
//! with one of these statistics. Quartile-based statistics use Tukey hinges:
//! the lower/upper quartile is the median of the lower/upper half, excluding
//! the middle element when the sample count is odd.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("statistic requires at least one value")]
    EmptyInput,
}

/// The statistic used to aggregate a span's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statistic {
    Sum,
    Mean,
    Median,
    #[serde(rename = "MAD")]
    Mad,
    Midhinge,
    Trimean,
}

impl Statistic {
    pub fn apply(&self, values: &[f64]) -> Result<f64, StatsError> {
        match self {
            Statistic::Sum => sum(values),
            Statistic::Mean => mean(values),
            Statistic::Median => median(values),
            Statistic::Mad => median_absolute_deviation(values),
            Statistic::Midhinge => midhinge(values),
            Statistic::Trimean => trimean(values),
        }
    }
}

pub fn sum(values: &[f64]) -> Result<f64, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptyInput);
    }
    Ok(values.iter().sum())
}

pub fn mean(values: &[f64]) -> Result<f64, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptyInput);
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptyInput);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(median_of_sorted(&sorted))
}

/// Median of the absolute deviations from the median.
pub fn median_absolute_deviation(values: &[f64]) -> Result<f64, StatsError> {
    let med = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations)
}

/// Average of the lower and upper quartiles.
pub fn midhinge(values: &[f64]) -> Result<f64, StatsError> {
    let (q1, _, q3) = quartiles(values)?;
    Ok((q1 + q3) / 2.0)
}

/// Weighted average of the quartiles: (Q1 + 2·Q2 + Q3) / 4.
pub fn trimean(values: &[f64]) -> Result<f64, StatsError> {
    let (q1, q2, q3) = quartiles(values)?;
    Ok((q1 + 2.0 * q2 + q3) / 4.0)
}

/// Tukey-hinge quartiles of an unsorted sample.
pub fn quartiles(values: &[f64]) -> Result<(f64, f64, f64), StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptyInput);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    let half = n / 2;
    let lower = &sorted[..half];
    // Odd-length samples exclude the middle element from both halves.
    let upper = &sorted[n - half..];

    let q2 = median_of_sorted(&sorted);
    // A single-element sample has empty halves; fall back to the median.
    if lower.is_empty() {
        return Ok((q2, q2, q2));
    }
    Ok((median_of_sorted(lower), q2, median_of_sorted(upper)))
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}
