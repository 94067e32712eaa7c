use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Plugins seeded with a default anomaly config by `init`
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            plugins: default_plugins(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectorConfig {
    #[serde(default)]
    pub cpu: CpuCollectorConfig,
    #[serde(default)]
    pub memory: ToggleConfig,
    #[serde(default)]
    pub load: ToggleConfig,
    #[serde(default)]
    pub disk: DiskCollectorConfig,
    #[serde(default)]
    pub fd: ToggleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToggleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CpuCollectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Gap between the two /proc/stat reads of one cycle
    #[serde(default = "default_cpu_sample_ms")]
    pub sample_ms: u64,
}

impl Default for CpuCollectorConfig {
    fn default() -> Self {
        Self { enabled: true, sample_ms: default_cpu_sample_ms() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiskCollectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mountpoints")]
    pub mountpoints: Vec<String>,
}

impl Default for DiskCollectorConfig {
    fn default() -> Self {
        Self { enabled: true, mountpoints: default_mountpoints() }
    }
}

/// Tuning for the pattern detectors and confidence bands
#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    #[serde(default = "default_trend_run_ratio")]
    pub trend_run_ratio: f64,
    #[serde(default = "default_spike_ratio")]
    pub spike_ratio: f64,
    #[serde(default = "default_high_confidence_multiplier")]
    pub high_confidence_multiplier: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            trend_run_ratio: default_trend_run_ratio(),
            spike_ratio: default_spike_ratio(),
            high_confidence_multiplier: default_high_confidence_multiplier(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl StorageConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: default_io_timeout_ms(),
            retention_days: default_retention_days(),
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertingConfig {
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    pub username: Option<String>,
    #[serde(default)]
    pub severity_filter: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    pub channel: Option<String>,
    #[serde(default)]
    pub severity_filter: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub severity_filter: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = expand_env_vars(content);

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let a = &self.analyzer;
        anyhow::ensure!(a.trend_run_ratio > 0.0, "analyzer.trend_run_ratio must be > 0");
        anyhow::ensure!(a.spike_ratio > 0.0, "analyzer.spike_ratio must be > 0");
        anyhow::ensure!(
            a.high_confidence_multiplier >= 1.0,
            "analyzer.high_confidence_multiplier must be >= 1"
        );
        anyhow::ensure!(self.storage.io_timeout_ms > 0, "storage.io_timeout_ms must be > 0");
        anyhow::ensure!(self.storage.max_workers > 0, "storage.max_workers must be > 0");
        Ok(())
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> String {
    static ENV_REF: OnceLock<regex::Regex> = OnceLock::new();
    let re = ENV_REF.get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env pattern"));
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/anomaly-agent") }
fn default_plugins() -> Vec<String> {
    ["cpu", "memory", "swap", "load", "disk", "fd"].iter().map(|s| s.to_string()).collect()
}
fn default_true() -> bool { true }
fn default_cpu_sample_ms() -> u64 { 500 }
fn default_mountpoints() -> Vec<String> { vec!["/".into()] }
fn default_trend_run_ratio() -> f64 { 0.25 }
fn default_spike_ratio() -> f64 { 1.5 }
fn default_high_confidence_multiplier() -> f64 { 1.5 }
fn default_io_timeout_ms() -> u64 { 2000 }
fn default_retention_days() -> u32 { 30 }
fn default_max_workers() -> usize { 8 }
