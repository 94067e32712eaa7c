use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::types::PluginSample;
use super::Collector;

/// One-minute load average, the first field of /proc/loadavg
pub fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

pub struct LoadCollector;

#[async_trait]
impl Collector for LoadCollector {
    fn name(&self) -> &str { "load" }

    async fn collect(&mut self) -> Result<Vec<PluginSample>> {
        let content = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .context("Failed to read /proc/loadavg")?;
        let load = parse_loadavg(&content).context("Malformed /proc/loadavg")?;
        Ok(vec![PluginSample::new("load", "load_1m", load, Utc::now())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_first_field() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 2/1154 32212\n"), Some(0.52));
        assert_eq!(parse_loadavg(""), None);
        assert_eq!(parse_loadavg("n/a"), None);
    }
}
