//! Seasonality-aware robust decomposition kernel.
//!
//! Splits the history into `major_frequency`-length periods, estimates the
//! seasonal component as the per-phase median across periods, and scores
//! each point by its residual against a MAD-derived scale. Median/MAD keep
//! the seasonal estimate and the scale insensitive to the very outliers
//! being hunted, which is what the robust-PCA family buys over plain
//! z-scores.
//!
//! With `autodiff` enabled the history is first-differenced before
//! decomposition, turning level shifts into single-point spikes.

use crate::config::{ConfigError, KernelConfig};
use crate::stats;

use super::{DetectAlgo, Detection, KernelError};

/// Points whose |normed residual| exceeds this are ruled anomalous.
const ANOMALY_THRESHOLD: f64 = 3.0;

/// Scales a MAD to be comparable with a standard deviation under normality.
const MAD_TO_SIGMA: f64 = 1.4826;

pub struct RpcaDetector {
    major_frequency: usize,
    autodiff: bool,
}

impl RpcaDetector {
    pub fn new(config: &KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            major_frequency: config.major_frequency as usize,
            autodiff: config.autodiff,
        })
    }

    /// Per-phase median across periods. `values.len()` must be a multiple
    /// of the season length.
    fn seasonal_medians(&self, values: &[f64]) -> Vec<f64> {
        let mut medians = Vec::with_capacity(self.major_frequency);
        for phase in 0..self.major_frequency {
            let column: Vec<f64> = values
                .iter()
                .skip(phase)
                .step_by(self.major_frequency)
                .copied()
                .collect();
            medians.push(stats::median(&column).unwrap_or(0.0));
        }
        medians
    }
}

impl DetectAlgo for RpcaDetector {
    fn detect(&mut self, history: &[f64]) -> Result<Detection, KernelError> {
        if history.is_empty() || history.len() % self.major_frequency != 0 {
            return Err(KernelError::HistoryNotPeriodAligned {
                len: history.len(),
                period: self.major_frequency,
            });
        }
        if history.iter().any(|v| !v.is_finite()) {
            return Err(KernelError::NonFiniteInput);
        }

        let values: Vec<f64> = if self.autodiff {
            let mut diffed = Vec::with_capacity(history.len());
            diffed.push(0.0);
            diffed.extend(history.windows(2).map(|pair| pair[1] - pair[0]));
            diffed
        } else {
            history.to_vec()
        };

        let seasonal = self.seasonal_medians(&values);
        let residuals: Vec<f64> = values
            .iter()
            .enumerate()
            .map(|(i, v)| v - seasonal[i % self.major_frequency])
            .collect();

        // Robust scale; a sparse outlier can zero the MAD, so fall back to
        // the mean absolute deviation before declaring the series flat.
        let mad = stats::median_absolute_deviation(&residuals).unwrap_or(0.0);
        let scale = if mad > f64::EPSILON {
            MAD_TO_SIGMA * mad
        } else {
            let mean_abs =
                residuals.iter().map(|r| r.abs()).sum::<f64>() / residuals.len() as f64;
            MAD_TO_SIGMA * mean_abs
        };

        if scale <= f64::EPSILON {
            // Perfectly seasonal history: nothing deviates.
            return Ok(Detection {
                anomalous: vec![false; history.len()],
                anomalousness: residuals.iter().map(|r| r.abs()).collect(),
                normed: vec![0.0; history.len()],
            });
        }

        let normed: Vec<f64> = residuals.iter().map(|r| r / scale).collect();
        Ok(Detection {
            anomalous: normed.iter().map(|n| n.abs() > ANOMALY_THRESHOLD).collect(),
            anomalousness: residuals.iter().map(|r| r.abs()).collect(),
            normed,
        })
    }
}
