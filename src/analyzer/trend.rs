use std::cmp::Ordering;

use crate::types::{AnomalyTag, DataPoint};

/// Shortest run (in steps) that may ever count as a trend.
pub const MIN_TREND_RUN: usize = 2;

/// Sensitivity at which the run ratio applies unscaled.
const REFERENCE_SENSITIVITY: f64 = 2.0;

/// Trend detection over the newest points of a series.
///
/// Counts the trailing run of strictly increasing (or strictly decreasing)
/// steps that ends at the newest point. The run must reach
/// `ceil(window * run_ratio * sensitivity / 2.0)` steps, clamped to
/// `[MIN_TREND_RUN, window - 1]`. `run_ratio` is a tuning knob
/// (`[analyzer] trend_run_ratio`): a stricter sensitivity asks for a longer,
/// more consistent run before a trend is reported.
pub struct TrendDetector {
    run_ratio: f64,
}

impl TrendDetector {
    pub fn new(run_ratio: f64) -> Self {
        Self { run_ratio }
    }

    /// Required run length, in steps, for the given window and sensitivity.
    pub fn run_threshold(&self, window: usize, sensitivity: f64) -> usize {
        let raw = (window as f64 * self.run_ratio * sensitivity / REFERENCE_SENSITIVITY).ceil();
        let upper = window.saturating_sub(1).max(MIN_TREND_RUN);
        if !raw.is_finite() || raw <= 0.0 {
            return MIN_TREND_RUN;
        }
        (raw as usize).clamp(MIN_TREND_RUN, upper)
    }

    /// `Some(TrendUp | TrendDown)` when the trailing run qualifies, `None` otherwise.
    pub fn evaluate(&self, points: &[DataPoint], window: usize, sensitivity: f64) -> Option<AnomalyTag> {
        let start = points.len().saturating_sub(window.max(2));
        let recent = &points[start..];
        if recent.len() < 2 {
            return None;
        }

        let mut steps = recent
            .windows(2)
            .rev()
            .map(|pair| pair[1].value.partial_cmp(&pair[0].value));

        let direction = match steps.next()? {
            Some(Ordering::Greater) => Ordering::Greater,
            Some(Ordering::Less) => Ordering::Less,
            _ => return None,
        };
        let run = 1 + steps.take_while(|step| *step == Some(direction)).count();

        if run < self.run_threshold(window, sensitivity) {
            return None;
        }

        Some(if direction == Ordering::Greater {
            AnomalyTag::TrendUp
        } else {
            AnomalyTag::TrendDown
        })
    }
}

/// Display form used by the CLI when no trend qualifies.
pub fn label(tag: Option<AnomalyTag>) -> String {
    tag.map(|t| t.to_string()).unwrap_or_else(|| "none".to_string())
}
