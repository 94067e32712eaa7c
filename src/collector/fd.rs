use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::types::PluginSample;
use super::{percent, Collector};

/// Allocated handles as a share of the system limit, from /proc/sys/fs/file-nr
pub fn parse_file_nr(content: &str) -> Option<f64> {
    let parts: Vec<f64> = content
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect();
    if parts.len() < 3 {
        return None;
    }
    percent(parts[0], parts[2])
}

/// Collects system-wide file descriptor usage
pub struct FdCollector;

#[async_trait]
impl Collector for FdCollector {
    fn name(&self) -> &str { "fd" }

    async fn collect(&mut self) -> Result<Vec<PluginSample>> {
        let content = tokio::fs::read_to_string("/proc/sys/fs/file-nr")
            .await
            .context("Failed to read /proc/sys/fs/file-nr")?;
        Ok(parse_file_nr(&content)
            .map(|usage| PluginSample::new("fd", "system_usage_percent", usage, Utc::now()))
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_of_max() {
        assert_eq!(parse_file_nr("2048\t0\t8192\n"), Some(25.0));
        assert_eq!(parse_file_nr("2048 0 0"), None);
        assert_eq!(parse_file_nr("2048"), None);
    }
}
