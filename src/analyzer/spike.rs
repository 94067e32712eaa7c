use crate::types::{AnomalyTag, DataPoint};

/// Single-point spike detection.
///
/// A spike deviates from the baseline mean by more than
/// `spike_sensitivity * std_dev` and by more than the previous sample did.
/// The second condition separates a fresh burst from a level shift that was
/// already building up over earlier samples.
pub struct SpikeDetector;

impl SpikeDetector {
    pub fn evaluate(
        &self,
        history: &[DataPoint],
        current: f64,
        mean: f64,
        std_dev: f64,
        spike_sensitivity: f64,
    ) -> Option<AnomalyTag> {
        let deviation = (current - mean).abs();
        if deviation <= spike_sensitivity * std_dev {
            return None;
        }

        let previous = history.last().map(|p| (p.value - mean).abs()).unwrap_or(0.0);
        if deviation > previous {
            Some(AnomalyTag::Spike)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::series;
    use crate::types::BaselineStats;

    fn check(history: &[f64], current: f64, spike_sensitivity: f64) -> Option<AnomalyTag> {
        let points = series(history);
        let stats = BaselineStats::from_history(&points);
        SpikeDetector.evaluate(&points, current, stats.mean, stats.std_dev, spike_sensitivity)
    }

    #[test]
    fn isolated_burst_is_a_spike() {
        let history = [49.0, 51.0, 49.0, 51.0, 49.0, 51.0, 49.0, 51.0, 49.0, 51.0];
        assert_eq!(check(&history, 60.0, 3.0), Some(AnomalyTag::Spike));
        assert_eq!(check(&history, 40.0, 3.0), Some(AnomalyTag::Spike));
    }

    #[test]
    fn deviation_within_band_is_not_a_spike() {
        let history = [49.0, 51.0, 49.0, 51.0, 49.0, 51.0, 49.0, 51.0, 49.0, 51.0];
        assert_eq!(check(&history, 52.5, 3.0), None);
    }

    #[test]
    fn sustained_shift_is_not_a_spike() {
        // last sample already sits further from the mean than the current one
        let history = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 40.0];
        assert_eq!(check(&history, 35.0, 1.0), None);
        assert_eq!(check(&history, 45.0, 1.0), Some(AnomalyTag::Spike));
    }

    #[test]
    fn zero_variance_baseline_flags_any_departure() {
        assert_eq!(check(&[7.0; 5], 7.5, 3.0), Some(AnomalyTag::Spike));
        assert_eq!(check(&[7.0; 5], 7.0, 3.0), None);
    }

    #[test]
    fn empty_history_compares_against_zero_deviation() {
        assert_eq!(SpikeDetector.evaluate(&[], 5.0, 0.0, 1.0, 2.0), Some(AnomalyTag::Spike));
        assert_eq!(SpikeDetector.evaluate(&[], 1.0, 0.0, 1.0, 2.0), None);
    }
}
