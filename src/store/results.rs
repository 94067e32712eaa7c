//! Append-only detection log, one file per plugin per UTC day.
//!
//! Line format: `<rfc3339 timestamp> <DetectionResult as JSON>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, NaiveDate, SecondsFormat, Utc};
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::types::{AnomalyTag, DetectionResult};
use super::{retry_once, validate_plugin_name, StoreIo};

const DAY_FORMAT: &str = "%Y-%m-%d";

/// `None` once the calendar runs out.
fn days_before(day: NaiveDate, n: u32) -> Option<NaiveDate> {
    day.checked_sub_days(Days::new(u64::from(n)))
}

/// Detection activity of one plugin over a range of days
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSummary {
    pub plugin: String,
    /// Days that had a log file
    pub days: usize,
    pub evaluations: usize,
    pub anomalies: usize,
    pub tag_counts: BTreeMap<AnomalyTag, usize>,
    /// Largest |score| among anomalies, finite or not
    pub max_abs_score: Option<f64>,
    pub last_anomaly: Option<DateTime<Utc>>,
}

impl PluginSummary {
    fn new(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            days: 0,
            evaluations: 0,
            anomalies: 0,
            tag_counts: BTreeMap::new(),
            max_abs_score: None,
            last_anomaly: None,
        }
    }

    fn add(&mut self, result: &DetectionResult) {
        self.evaluations += 1;
        if !result.is_anomaly {
            return;
        }
        self.anomalies += 1;
        for tag in &result.anomaly_type {
            *self.tag_counts.entry(*tag).or_default() += 1;
        }
        let score = result.anomaly_score.abs();
        if !score.is_nan() {
            self.max_abs_score = Some(self.max_abs_score.map_or(score, |m| m.max(score)));
        }
        if self.last_anomaly.map_or(true, |t| result.timestamp > t) {
            self.last_anomaly = Some(result.timestamp);
        }
    }
}

pub struct ResultRecorder {
    dir: PathBuf,
    io: StoreIo,
}

impl ResultRecorder {
    pub fn new(data_dir: &Path, io: StoreIo) -> Self {
        Self { dir: data_dir.join("results"), io }
    }

    fn day_path(&self, plugin: &str, day: NaiveDate) -> PathBuf {
        self.dir.join(plugin).join(format!("{}.log", day.format(DAY_FORMAT)))
    }

    /// Append `result` to its plugin's log for the result's UTC day.
    pub async fn persist(&self, result: &DetectionResult) -> Result<PathBuf> {
        validate_plugin_name(&result.plugin)?;
        let path = self.day_path(&result.plugin, result.timestamp.date_naive());
        let line = format!(
            "{} {}",
            result.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            serde_json::to_string(result).map_err(StorageError::from)?
        );
        // not retried: a second append after a timeout could duplicate the line
        self.io.append_line(&path, &line).await?;
        Ok(path)
    }

    /// All results recorded for `plugin` on `day`, in write order.
    pub async fn load_day(&self, plugin: &str, day: NaiveDate) -> Result<Vec<DetectionResult>> {
        validate_plugin_name(plugin)?;
        let path = self.day_path(plugin, day);
        let Some(content) = retry_once("results load", || self.io.read_optional(&path)).await? else {
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        let mut skipped = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let parsed = line
                .split_once(' ')
                .and_then(|(_, json)| serde_json::from_str::<DetectionResult>(json).ok());
            match parsed {
                Some(result) => results.push(result),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "Skipped unreadable result lines");
        }
        Ok(results)
    }

    async fn plugins(&self) -> Result<Vec<String>> {
        let names = retry_once("results list", || self.io.list_dir(&self.dir)).await?;
        Ok(names.into_iter().filter(|n| validate_plugin_name(n).is_ok()).collect())
    }

    /// Days that have a log for `plugin`, oldest first. Other files are ignored.
    async fn days(&self, plugin: &str) -> Result<Vec<NaiveDate>> {
        let dir = self.dir.join(plugin);
        let names = retry_once("results list", || self.io.list_dir(&dir)).await?;
        Ok(names
            .iter()
            .filter_map(|name| name.strip_suffix(".log"))
            .filter_map(|stem| NaiveDate::parse_from_str(stem, DAY_FORMAT).ok())
            .collect())
    }

    /// Per-plugin summary over the `days` days ending with `today`.
    pub async fn summarize(&self, plugin: Option<&str>, days: u32, today: NaiveDate) -> Result<Vec<PluginSummary>> {
        let plugins = match plugin {
            Some(p) => {
                validate_plugin_name(p)?;
                vec![p.to_string()]
            }
            None => self.plugins().await?,
        };

        let first = days_before(today, days.max(1) - 1).unwrap_or(NaiveDate::MIN);
        let mut summaries = Vec::with_capacity(plugins.len());
        for name in plugins {
            let mut summary = PluginSummary::new(&name);
            for day in self.days(&name).await? {
                if day < first || day > today {
                    continue;
                }
                summary.days += 1;
                for result in self.load_day(&name, day).await? {
                    summary.add(&result);
                }
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Delete day logs older than `retention_days` before `today`.
    /// Returns the number of files removed.
    pub async fn cleanup(&self, retention_days: u32, today: NaiveDate) -> Result<usize> {
        let horizon = days_before(today, retention_days).unwrap_or(NaiveDate::MIN);
        let mut removed = 0usize;

        for plugin in self.plugins().await? {
            for day in self.days(&plugin).await? {
                if day < horizon && self.io.remove_if_exists(&self.day_path(&plugin, day)).await? {
                    removed += 1;
                }
            }
        }

        info!(removed, retention_days, "Result log cleanup finished");
        Ok(removed)
    }
}
