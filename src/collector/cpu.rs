use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use crate::config::CpuCollectorConfig;
use crate::types::PluginSample;
use super::{percent, Collector};

/// Aggregate jiffies from the `cpu ` line of /proc/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    /// idle + iowait
    pub idle: u64,
}

/// Parse the aggregate line of /proc/stat
pub fn parse_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();

    if fields.len() < 4 {
        return None;
    }

    // guest and guest_nice are already counted in user and nice
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes { total, idle })
}

/// Busy share of the jiffies elapsed between two readings
pub fn usage_between(prev: CpuTimes, cur: CpuTimes) -> Option<f64> {
    let d_total = cur.total.saturating_sub(prev.total);
    let d_idle = cur.idle.saturating_sub(prev.idle);
    percent(d_total.saturating_sub(d_idle) as f64, d_total as f64)
}

/// Collects CPU usage from two /proc/stat reads `sample_ms` apart
pub struct CpuCollector {
    sample_interval: Duration,
}

impl CpuCollector {
    pub fn new(config: &CpuCollectorConfig) -> Self {
        Self { sample_interval: Duration::from_millis(config.sample_ms) }
    }

    async fn read() -> Result<CpuTimes> {
        let content = tokio::fs::read_to_string("/proc/stat")
            .await
            .context("Failed to read /proc/stat")?;
        parse_stat(&content).context("No aggregate cpu line in /proc/stat")
    }
}

#[async_trait]
impl Collector for CpuCollector {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn collect(&mut self) -> Result<Vec<PluginSample>> {
        let first = Self::read().await?;
        tokio::time::sleep(self.sample_interval).await;
        let second = Self::read().await?;

        Ok(usage_between(first, second)
            .map(|usage| PluginSample::new("cpu", "usage_percent", usage, Utc::now()))
            .into_iter()
            .collect())
    }
}
