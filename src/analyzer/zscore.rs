use smallvec::smallvec;

use crate::types::{AnomalyTag, BaselineStats, Confidence, DataPoint, DetectionResult, PluginSample};
use super::Evaluation;

/// Z-Score based anomaly detection.
/// Judges the newest sample against the mean and population standard
/// deviation of the prior history; the sample is never part of its own baseline.
pub struct StatisticalDetector {
    high_multiplier: f64,
}

impl StatisticalDetector {
    pub fn new(high_multiplier: f64) -> Self {
        Self { high_multiplier }
    }

    pub fn evaluate(
        &self,
        history: &[DataPoint],
        current: &PluginSample,
        sensitivity: f64,
        min_data_points: usize,
    ) -> Evaluation {
        if history.len() < min_data_points || history.is_empty() {
            return Evaluation::InsufficientData {
                available: history.len(),
                required: min_data_points.max(1),
            };
        }

        let statistics = BaselineStats::from_history(history);
        let score = z_score(current.value, statistics.mean, statistics.std_dev);
        let magnitude = score.abs();
        let is_anomaly = magnitude >= sensitivity;

        let confidence = if magnitude >= sensitivity * self.high_multiplier {
            Confidence::High
        } else if is_anomaly {
            Confidence::Medium
        } else {
            Confidence::Low
        };

        Evaluation::Evaluated(DetectionResult {
            plugin: current.plugin.clone(),
            metric: current.metric.clone(),
            timestamp: current.timestamp,
            current_value: current.value,
            is_anomaly,
            anomaly_score: score,
            anomaly_type: if is_anomaly { smallvec![AnomalyTag::Statistical] } else { smallvec![] },
            confidence,
            statistics,
        })
    }
}

/// Zero variance makes any departure from the mean infinitely unlikely.
fn z_score(value: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev > 0.0 {
        return (value - mean) / std_dev;
    }
    if value == mean {
        0.0
    } else if value > mean {
        f64::INFINITY
    } else {
        f64::NEG_INFINITY
    }
}
