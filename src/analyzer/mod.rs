pub mod spike;
pub mod trend;
pub mod zscore;

use crate::config::AnalyzerConfig;
use crate::store::AnomalyConfig;
use crate::types::{BaselineStats, DataPoint, DetectionResult, PluginSample};

use spike::SpikeDetector;
use trend::TrendDetector;
use zscore::StatisticalDetector;

/// Result of judging one sample against its history.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Warm-up: fewer retained points than `min_data_points`.
    InsufficientData { available: usize, required: usize },
    Evaluated(DetectionResult),
}

impl Evaluation {
    pub fn result(&self) -> Option<&DetectionResult> {
        match self {
            Evaluation::Evaluated(r) => Some(r),
            Evaluation::InsufficientData { .. } => None,
        }
    }

    pub fn is_anomaly(&self) -> bool {
        self.result().is_some_and(|r| r.is_anomaly)
    }
}

impl BaselineStats {
    /// Mean and population standard deviation of `history`
    pub fn from_history(history: &[DataPoint]) -> Self {
        if history.is_empty() {
            return Self { mean: 0.0, std_dev: 0.0, sample_count: 0 };
        }

        let n = history.len() as f64;
        let mean = history.iter().map(|p| p.value).sum::<f64>() / n;
        let variance = history.iter().map(|p| (p.value - mean).powi(2)).sum::<f64>() / n;

        Self {
            mean,
            std_dev: variance.sqrt(),
            sample_count: history.len(),
        }
    }
}

/// Statistical detection plus the optional pattern enhancement.
///
/// Pattern detectors only run on samples the statistical detector already
/// flagged. Each agreeing pattern raises confidence one level; two or more
/// agreeing patterns raise it straight to high.
pub struct Detector {
    statistical: StatisticalDetector,
    trend: TrendDetector,
    spike: SpikeDetector,
    spike_ratio: f64,
}

impl Detector {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            statistical: StatisticalDetector::new(config.high_confidence_multiplier),
            trend: TrendDetector::new(config.trend_run_ratio),
            spike: SpikeDetector,
            spike_ratio: config.spike_ratio,
        }
    }

    /// Evaluate `sample` against the prior `history` (which must not contain it).
    pub fn detect(&self, history: &[DataPoint], sample: &PluginSample, config: &AnomalyConfig) -> Evaluation {
        match self.statistical.evaluate(history, sample, config.sensitivity, config.min_data_points) {
            Evaluation::Evaluated(mut result) => {
                self.enhance(&mut result, history, config);
                Evaluation::Evaluated(result)
            }
            warmup => warmup,
        }
    }

    fn enhance(&self, result: &mut DetectionResult, history: &[DataPoint], config: &AnomalyConfig) {
        if !result.is_anomaly || !config.check_patterns {
            return;
        }

        let mut agreeing = 0usize;

        if config.detect_trends {
            let mut series = Vec::with_capacity(history.len() + 1);
            series.extend_from_slice(history);
            series.push(DataPoint { timestamp: result.timestamp, value: result.current_value });

            if let Some(tag) = self.trend.evaluate(&series, config.window_size, config.sensitivity) {
                result.anomaly_type.push(tag);
                agreeing += 1;
            }
        }

        if config.detect_spikes {
            let stats = result.statistics;
            let spike_sensitivity = config.sensitivity * self.spike_ratio;
            if let Some(tag) =
                self.spike.evaluate(history, result.current_value, stats.mean, stats.std_dev, spike_sensitivity)
            {
                result.anomaly_type.push(tag);
                agreeing += 1;
            }
        }

        result.confidence = match agreeing {
            0 => result.confidence,
            1 => result.confidence.raised(),
            _ => crate::types::Confidence::High,
        };

        tracing::trace!(
            plugin = %result.plugin,
            metric = %result.metric,
            tags = %result.tags_label(),
            confidence = %result.confidence,
            "Enhanced detection result"
        );
    }
}
