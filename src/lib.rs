pub mod alerter;
pub mod analyzer;
pub mod collector;
pub mod config;
pub mod debounce;
pub mod error;
pub mod pipeline;
pub mod store;

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use smallvec::SmallVec;

    /// One scalar produced by a collector plugin in a cycle
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PluginSample {
        pub timestamp: DateTime<Utc>,
        pub plugin: String,
        pub metric: String,
        pub value: f64,
    }

    impl PluginSample {
        pub fn new(plugin: impl Into<String>, metric: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
            Self {
                timestamp,
                plugin: plugin.into(),
                metric: metric.into(),
                value,
            }
        }

        pub fn point(&self) -> DataPoint {
            DataPoint { timestamp: self.timestamp, value: self.value }
        }
    }

    /// A single retained history point
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct DataPoint {
        pub timestamp: DateTime<Utc>,
        pub value: f64,
    }

    /// Severity handed to the notification transport
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Severity {
        Low,
        Medium,
        High,
    }

    /// How sure the detector is about an anomaly
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Confidence {
        Low,
        Medium,
        High,
    }

    impl Confidence {
        /// One level up, saturating at `High`
        pub fn raised(self) -> Self {
            match self {
                Confidence::Low => Confidence::Medium,
                Confidence::Medium | Confidence::High => Confidence::High,
            }
        }

        pub fn severity(self) -> Severity {
            match self {
                Confidence::Low => Severity::Low,
                Confidence::Medium => Severity::Medium,
                Confidence::High => Severity::High,
            }
        }
    }

    /// Classification tags attached to a detection result
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum AnomalyTag {
        Statistical,
        TrendUp,
        TrendDown,
        Spike,
    }

    pub type AnomalyTags = SmallVec<[AnomalyTag; 4]>;

    /// Baseline statistics of the history a sample was judged against
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct BaselineStats {
        pub mean: f64,
        pub std_dev: f64,
        pub sample_count: usize,
    }

    /// Outcome of evaluating one sample. Never mutated once recorded.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct DetectionResult {
        pub plugin: String,
        pub metric: String,
        pub timestamp: DateTime<Utc>,
        pub current_value: f64,
        pub is_anomaly: bool,
        #[serde(with = "score_serde")]
        pub anomaly_score: f64,
        pub anomaly_type: AnomalyTags,
        pub confidence: Confidence,
        pub statistics: BaselineStats,
    }

    impl DetectionResult {
        pub fn has_tag(&self, tag: AnomalyTag) -> bool {
            self.anomaly_type.contains(&tag)
        }

        /// Comma separated tag list, "none" when empty
        pub fn tags_label(&self) -> String {
            if self.anomaly_type.is_empty() {
                return "none".to_string();
            }
            self.anomaly_type
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(",")
        }
    }

    /// JSON has no infinity; a zero-variance baseline yields one
    mod score_serde {
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
            if value.is_finite() {
                s.serialize_f64(*value)
            } else if value.is_nan() {
                s.serialize_str("nan")
            } else if *value > 0.0 {
                s.serialize_str("inf")
            } else {
                s.serialize_str("-inf")
            }
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
            match Repr::deserialize(d)? {
                Repr::Number(v) => Ok(v),
                Repr::Text(t) => match t.as_str() {
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    "nan" => Ok(f64::NAN),
                    other => Err(D::Error::custom(format!("invalid anomaly score '{}'", other))),
                },
            }
        }
    }

    impl std::fmt::Display for Severity {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Severity::Low => write!(f, "LOW"),
                Severity::Medium => write!(f, "MEDIUM"),
                Severity::High => write!(f, "HIGH"),
            }
        }
    }

    impl std::fmt::Display for Confidence {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Confidence::Low => write!(f, "low"),
                Confidence::Medium => write!(f, "medium"),
                Confidence::High => write!(f, "high"),
            }
        }
    }

    impl std::fmt::Display for AnomalyTag {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let s = match self {
                AnomalyTag::Statistical => "statistical",
                AnomalyTag::TrendUp => "trend_up",
                AnomalyTag::TrendDown => "trend_down",
                AnomalyTag::Spike => "spike",
            };
            write!(f, "{}", s)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use smallvec::smallvec;

        fn result(score: f64) -> DetectionResult {
            DetectionResult {
                plugin: "cpu".into(),
                metric: "usage_percent".into(),
                timestamp: Utc::now(),
                current_value: 15.0,
                is_anomaly: true,
                anomaly_score: score,
                anomaly_type: smallvec![AnomalyTag::Statistical, AnomalyTag::Spike],
                confidence: Confidence::High,
                statistics: BaselineStats { mean: 10.0, std_dev: 0.0, sample_count: 10 },
            }
        }

        #[test]
        fn infinite_score_survives_json() {
            let json = serde_json::to_string(&result(f64::INFINITY)).unwrap();
            assert!(json.contains("\"anomaly_score\":\"inf\""));
            assert!(json.contains("\"anomaly_type\":[\"statistical\",\"spike\"]"));

            let back: DetectionResult = serde_json::from_str(&json).unwrap();
            assert_eq!(back.anomaly_score, f64::INFINITY);

            let neg: DetectionResult =
                serde_json::from_str(&serde_json::to_string(&result(f64::NEG_INFINITY)).unwrap()).unwrap();
            assert_eq!(neg.anomaly_score, f64::NEG_INFINITY);
        }

        #[test]
        fn confidence_raises_and_saturates() {
            assert_eq!(Confidence::Low.raised(), Confidence::Medium);
            assert_eq!(Confidence::Medium.raised(), Confidence::High);
            assert_eq!(Confidence::High.raised(), Confidence::High);
            assert_eq!(Confidence::Medium.severity(), Severity::Medium);
        }

        #[test]
        fn tags_label_lists_tags() {
            assert_eq!(result(3.0).tags_label(), "statistical,spike");
            let mut r = result(0.1);
            r.anomaly_type.clear();
            assert_eq!(r.tags_label(), "none");
        }
    }
}
