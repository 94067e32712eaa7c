use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::config::DiskCollectorConfig;
use crate::types::PluginSample;
use super::{percent, Collector};

/// Plugin name for a mountpoint: `disk` for `/`, `disk_<mount>` otherwise.
pub fn plugin_for_mount(mountpoint: &str) -> String {
    let sanitized: String = mountpoint
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let sanitized = sanitized.trim_matches('_');
    if sanitized.is_empty() {
        "disk".to_string()
    } else {
        format!("disk_{}", sanitized)
    }
}

/// Used share of the filesystem from `df -P` output, computed from the
/// used and available block counts (reserved blocks excluded, as df does).
pub fn parse_df(output: &str) -> Option<f64> {
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let used: f64 = fields[2].parse().ok()?;
    let available: f64 = fields[3].parse().ok()?;
    percent(used, used + available)
}

/// Filesystem usage per configured mountpoint via `df -P`
pub struct DiskCollector {
    mountpoints: Vec<String>,
}

impl DiskCollector {
    pub fn new(config: &DiskCollectorConfig) -> Self {
        Self { mountpoints: config.mountpoints.clone() }
    }

    async fn usage(mountpoint: &str) -> Result<f64> {
        let output = tokio::process::Command::new("df")
            .arg("-P")
            .arg(mountpoint)
            .output()
            .await
            .context("Failed to run df")?;
        anyhow::ensure!(
            output.status.success(),
            "df {} failed: {}",
            mountpoint,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        parse_df(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("Unexpected df output for {}", mountpoint))
    }
}

#[async_trait]
impl Collector for DiskCollector {
    fn name(&self) -> &str { "disk" }

    async fn collect(&mut self) -> Result<Vec<PluginSample>> {
        let now = Utc::now();
        let mut samples = Vec::new();

        for mountpoint in &self.mountpoints {
            match Self::usage(mountpoint).await {
                Ok(usage) => samples.push(PluginSample::new(plugin_for_mount(mountpoint), "usage_percent", usage, now)),
                Err(e) => tracing::warn!(mountpoint = %mountpoint, error = %e, "Disk usage unavailable"),
            }
        }

        anyhow::ensure!(
            !samples.is_empty() || self.mountpoints.is_empty(),
            "No mountpoint could be measured"
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_names_become_plugin_names() {
        assert_eq!(plugin_for_mount("/"), "disk");
        assert_eq!(plugin_for_mount("/var/lib"), "disk_var_lib");
        assert_eq!(plugin_for_mount("/mnt/data-01/"), "disk_mnt_data-01");
        assert!(crate::store::validate_plugin_name(&plugin_for_mount("/media/my disk")).is_ok());
    }

    #[test]
    fn parses_posix_df() {
        let out = "Filesystem     1024-blocks     Used Available Capacity Mounted on\n\
                   /dev/sda1        100000000 30000000  60000000      34% /\n";
        let usage = parse_df(out).unwrap();
        assert!((usage - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_unexpected_output() {
        assert_eq!(parse_df("Filesystem 1024-blocks Used Available Capacity Mounted on\n"), None);
        assert_eq!(parse_df(""), None);
    }
}
