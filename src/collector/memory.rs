use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::types::PluginSample;
use super::{percent, Collector};

/// The /proc/meminfo fields the agent cares about, in kB
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

impl MemInfo {
    pub fn usage_percent(&self) -> Option<f64> {
        percent(self.total_kb.saturating_sub(self.available_kb) as f64, self.total_kb as f64)
    }

    /// `None` on hosts without swap
    pub fn swap_usage_percent(&self) -> Option<f64> {
        percent(self.swap_total_kb.saturating_sub(self.swap_free_kb) as f64, self.swap_total_kb as f64)
    }
}

pub fn parse_meminfo(content: &str) -> MemInfo {
    let mut info = MemInfo::default();
    let mut free_kb = 0u64;
    let mut buffers_kb = 0u64;
    let mut cached_kb = 0u64;
    let mut has_available = false;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 { continue; }
        let val: u64 = parts[1].parse().unwrap_or(0);
        match parts[0] {
            "MemTotal:" => info.total_kb = val,
            "MemAvailable:" => { info.available_kb = val; has_available = true; }
            "MemFree:" => free_kb = val,
            "Buffers:" => buffers_kb = val,
            "Cached:" => cached_kb = val,
            "SwapTotal:" => info.swap_total_kb = val,
            "SwapFree:" => info.swap_free_kb = val,
            _ => {}
        }
    }

    // Fallback for kernels without MemAvailable
    if !has_available {
        info.available_kb = free_kb + buffers_kb + cached_kb;
    }
    info
}

/// Memory and swap usage from /proc/meminfo, as plugins `memory` and `swap`
pub struct MemoryCollector;

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &str { "memory" }

    async fn collect(&mut self) -> Result<Vec<PluginSample>> {
        let content = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .context("Failed to read /proc/meminfo")?;
        let info = parse_meminfo(&content);
        let now = Utc::now();

        let mut samples = Vec::new();
        if let Some(usage) = info.usage_percent() {
            samples.push(PluginSample::new("memory", "usage_percent", usage, now));
        }
        if let Some(usage) = info.swap_usage_percent() {
            samples.push(PluginSample::new("swap", "usage_percent", usage, now));
        }
        Ok(samples)
    }
}
