//! Per-plugin anomaly-detection settings.
//!
//! One TOML record per plugin under `<data_dir>/config/<plugin>.toml`.
//! Records are validated field by field against [`FIELDS`]; the store never
//! falls back to defaults for a bad value, callers decide what to do.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError, ValidationError};
use super::{retry_once, sibling, validate_plugin_name, StoreIo};

/// Anomaly-detection settings for one plugin
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyConfig {
    pub plugin: String,
    pub enabled: bool,
    /// Z-score magnitude at which a sample is anomalous
    pub sensitivity: f64,
    /// Retained history points per series
    pub window_size: usize,
    /// History points required before detection runs
    pub min_data_points: usize,
    pub check_patterns: bool,
    pub detect_spikes: bool,
    pub detect_trends: bool,
    /// Consecutive anomalies required before alerting
    pub notification_threshold: u32,
    /// Minimum spacing between alerts
    pub cooldown_seconds: u64,
}

impl AnomalyConfig {
    pub fn default_for(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            enabled: true,
            sensitivity: 2.0,
            window_size: 20,
            min_data_points: 10,
            check_patterns: true,
            detect_spikes: true,
            detect_trends: true,
            notification_threshold: 3,
            cooldown_seconds: 1800,
        }
    }

    fn encode(&self) -> std::result::Result<String, StorageError> {
        Ok(toml::to_string(self)?)
    }
}

/// Validator kinds. Each is a pure predicate over the raw text of a field.
#[derive(Debug, Clone, Copy)]
enum Check {
    Required,
    /// finite and non-negative
    Numeric,
    /// non-negative whole number
    Integer,
    Boolean,
    AtLeast(f64),
    Positive,
    PluginName,
}

impl Check {
    /// `Err(expected)` when the value fails. Absent values only fail `Required`.
    fn apply(self, raw: Option<&str>) -> std::result::Result<(), &'static str> {
        let Some(raw) = raw else {
            return match self {
                Check::Required => Err("a value"),
                _ => Ok(()),
            };
        };
        let number = || raw.trim().parse::<f64>().ok().filter(|v| v.is_finite());
        let ok = match self {
            Check::Required => true,
            Check::Numeric => number().is_some_and(|v| v >= 0.0),
            Check::Integer => raw.trim().parse::<u64>().is_ok(),
            Check::Boolean => raw == "true" || raw == "false",
            Check::AtLeast(min) => number().is_some_and(|v| v >= min),
            Check::Positive => number().is_some_and(|v| v > 0.0),
            Check::PluginName => validate_plugin_name(raw).is_ok(),
        };
        if ok {
            Ok(())
        } else {
            Err(self.expected())
        }
    }

    fn expected(self) -> &'static str {
        match self {
            Check::Required => "a value",
            Check::Numeric => "a non-negative number",
            Check::Integer => "a non-negative integer",
            Check::Boolean => "exactly 'true' or 'false'",
            Check::AtLeast(_) => "a number of at least 1",
            Check::Positive => "a number greater than 0",
            Check::PluginName => "a name matching [a-zA-Z0-9_-]+",
        }
    }
}

struct Field {
    key: &'static str,
    checks: &'static [Check],
}

const FIELDS: &[Field] = &[
    Field { key: "plugin", checks: &[Check::Required, Check::PluginName] },
    Field { key: "enabled", checks: &[Check::Required, Check::Boolean] },
    Field { key: "sensitivity", checks: &[Check::Required, Check::Numeric, Check::Positive] },
    Field { key: "window_size", checks: &[Check::Required, Check::Integer, Check::AtLeast(1.0)] },
    Field { key: "min_data_points", checks: &[Check::Required, Check::Integer] },
    Field { key: "check_patterns", checks: &[Check::Boolean] },
    Field { key: "detect_spikes", checks: &[Check::Boolean] },
    Field { key: "detect_trends", checks: &[Check::Boolean] },
    Field { key: "notification_threshold", checks: &[Check::Integer, Check::AtLeast(1.0)] },
    Field { key: "cooldown_seconds", checks: &[Check::Integer] },
];

fn field(key: &str) -> Option<&'static Field> {
    FIELDS.iter().find(|f| f.key == key)
}

/// Raw key/value view of a record, values as text
type RawRecord = BTreeMap<String, String>;

fn check_value(plugin: &str, field: &Field, raw: Option<&str>) -> std::result::Result<(), ValidationError> {
    for check in field.checks {
        if let Err(expected) = check.apply(raw) {
            return Err(match (check, raw) {
                (Check::Required, _) | (_, None) => ValidationError::MissingKey {
                    plugin: plugin.to_string(),
                    key: field.key,
                },
                (_, Some(value)) => ValidationError::Malformed {
                    plugin: plugin.to_string(),
                    key: field.key.to_string(),
                    value: value.to_string(),
                    expected,
                },
            });
        }
    }
    Ok(())
}

/// Validate a raw record and build the typed config.
fn parse_record(plugin: &str, raw: &RawRecord) -> std::result::Result<AnomalyConfig, ValidationError> {
    validate_plugin_name(plugin)?;

    if let Some(unknown) = raw.keys().find(|k| field(k).is_none()) {
        return Err(ValidationError::UnknownKey { plugin: plugin.to_string(), key: unknown.clone() });
    }
    for f in FIELDS {
        check_value(plugin, f, raw.get(f.key).map(String::as_str))?;
    }

    // Values below have passed their checks.
    let defaults = AnomalyConfig::default_for(plugin);
    let text = |key: &str| raw.get(key).map(|v| v.trim());
    let flag = |key: &str, default: bool| text(key).map(|v| v == "true").unwrap_or(default);
    let whole = |key: &str, default: u64| text(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default);

    let config = AnomalyConfig {
        plugin: text("plugin").unwrap_or(plugin).to_string(),
        enabled: flag("enabled", defaults.enabled),
        sensitivity: text("sensitivity").and_then(|v| v.parse().ok()).unwrap_or(defaults.sensitivity),
        window_size: whole("window_size", defaults.window_size as u64) as usize,
        min_data_points: whole("min_data_points", defaults.min_data_points as u64) as usize,
        check_patterns: flag("check_patterns", defaults.check_patterns),
        detect_spikes: flag("detect_spikes", defaults.detect_spikes),
        detect_trends: flag("detect_trends", defaults.detect_trends),
        notification_threshold: u32::try_from(whole("notification_threshold", defaults.notification_threshold as u64))
            .map_err(|_| ValidationError::Malformed {
                plugin: plugin.to_string(),
                key: "notification_threshold".into(),
                value: text("notification_threshold").unwrap_or_default().to_string(),
                expected: "an integer that fits in 32 bits",
            })?,
        cooldown_seconds: whole("cooldown_seconds", defaults.cooldown_seconds),
    };

    if config.plugin != plugin {
        return Err(ValidationError::Invariant {
            plugin: plugin.to_string(),
            reason: format!("record names plugin '{}'", config.plugin),
        });
    }
    if config.min_data_points > config.window_size {
        return Err(ValidationError::Invariant {
            plugin: plugin.to_string(),
            reason: format!(
                "min_data_points ({}) exceeds window_size ({})",
                config.min_data_points, config.window_size
            ),
        });
    }

    Ok(config)
}

fn decode(path: &Path, content: &str) -> std::result::Result<RawRecord, StorageError> {
    let table: toml::Table = toml::from_str(content).map_err(|e| StorageError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut raw = RawRecord::new();
    for (key, value) in table {
        let text = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            other => {
                return Err(StorageError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("key '{}' holds a {} instead of a scalar", key, other.type_str()),
                })
            }
        };
        raw.insert(key, text);
    }
    Ok(raw)
}

struct CacheEntry {
    config: AnomalyConfig,
    fresh: bool,
}

/// Loads, validates, caches and updates per-plugin [`AnomalyConfig`] records.
pub struct ConfigStore {
    dir: PathBuf,
    io: StoreIo,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ConfigStore {
    pub fn new(data_dir: &Path, io: StoreIo) -> Self {
        Self {
            dir: data_dir.join("config"),
            io,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, plugin: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", plugin))
    }

    fn cached(&self, plugin: &str) -> Option<AnomalyConfig> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(plugin).filter(|e| e.fresh).map(|e| e.config.clone())
    }

    fn remember(&self, config: &AnomalyConfig) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(config.plugin.clone(), CacheEntry { config: config.clone(), fresh: true });
    }

    /// Mark the cached entry stale so the next `get` reloads from disk.
    pub fn invalidate(&self, plugin: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = cache.get_mut(plugin) {
            entry.fresh = false;
        }
    }

    /// Mark every cached entry stale.
    pub fn invalidate_all(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        for entry in cache.values_mut() {
            entry.fresh = false;
        }
    }

    async fn read_raw(&self, plugin: &str) -> Result<Option<RawRecord>> {
        let path = self.path(plugin);
        let content = retry_once("config load", || self.io.read_optional(&path)).await?;
        match content {
            Some(content) => Ok(Some(decode(&path, &content)?)),
            None => Ok(None),
        }
    }

    /// Validated config for `plugin`. The first reference to a plugin without
    /// a record persists and returns the defaults.
    pub async fn get(&self, plugin: &str) -> Result<AnomalyConfig> {
        validate_plugin_name(plugin)?;
        if let Some(config) = self.cached(plugin) {
            return Ok(config);
        }

        let config = match self.read_raw(plugin).await? {
            Some(raw) => parse_record(plugin, &raw)?,
            None => {
                let config = AnomalyConfig::default_for(plugin);
                self.write(&config).await?;
                info!(plugin, "Created default anomaly config");
                config
            }
        };

        debug!(plugin, "Loaded anomaly config");
        self.remember(&config);
        Ok(config)
    }

    async fn write(&self, config: &AnomalyConfig) -> Result<()> {
        let path = self.path(&config.plugin);
        let body = config.encode()?;
        retry_once("config write", || self.io.write_atomic(&path, body.as_bytes())).await?;
        Ok(())
    }

    /// Update one key. The full record is re-validated before anything is
    /// written, the previous record is kept as a backup until the write and a
    /// fresh reload both succeed, and restored otherwise.
    pub async fn set(&self, plugin: &str, key: &str, value: &str) -> Result<AnomalyConfig> {
        validate_plugin_name(plugin)?;
        let def = field(key).ok_or_else(|| ValidationError::UnknownKey {
            plugin: plugin.to_string(),
            key: key.to_string(),
        })?;
        if def.key == "plugin" && value != plugin {
            return Err(ValidationError::Invariant {
                plugin: plugin.to_string(),
                reason: "the plugin key cannot be renamed".to_string(),
            }
            .into());
        }
        check_value(plugin, def, Some(value))?;

        let mut raw = match self.read_raw(plugin).await? {
            Some(raw) => raw,
            None => decode(&self.path(plugin), &AnomalyConfig::default_for(plugin).encode()?)?,
        };
        raw.insert(key.to_string(), value.to_string());
        let updated = parse_record(plugin, &raw)?;

        let path = self.path(plugin);
        let backup = sibling(&path, "bak");
        let had_record = self.io.exists(&path).await?;
        if had_record {
            self.io.copy(&path, &backup).await?;
        }

        match self.commit(&updated).await {
            Ok(reloaded) => {
                if had_record {
                    self.io.remove_if_exists(&backup).await?;
                }
                info!(plugin, key, value, "Updated anomaly config");
                Ok(reloaded)
            }
            Err(err) => {
                warn!(plugin, key, error = %err, "Config update failed, restoring previous record");
                let restored = if had_record {
                    self.io.rename(&backup, &path).await.map(|_| ())
                } else {
                    self.io.remove_if_exists(&path).await.map(|_| ())
                };
                if let Err(restore_err) = restored {
                    warn!(plugin, error = %restore_err, "Could not restore previous config record");
                }
                self.invalidate(plugin);
                Err(err)
            }
        }
    }

    async fn commit(&self, config: &AnomalyConfig) -> Result<AnomalyConfig> {
        self.write(config).await?;
        self.invalidate(&config.plugin);
        self.get(&config.plugin).await
    }

    /// Seed default records for plugins that have none. Existing records are
    /// left untouched. Returns the plugins that were created.
    pub async fn create_defaults(&self, plugins: &[String]) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for plugin in plugins {
            validate_plugin_name(plugin)?;
            if self.io.exists(&self.path(plugin)).await? {
                continue;
            }
            self.write(&AnomalyConfig::default_for(plugin)).await?;
            created.push(plugin.clone());
        }
        if !created.is_empty() {
            info!(count = created.len(), "Seeded default anomaly configs");
        }
        Ok(created)
    }

    /// Plugins that have a config record, sorted
    pub async fn list_plugins(&self) -> Result<Vec<String>> {
        let names = self.io.list_dir(&self.dir).await?;
        Ok(names
            .iter()
            .filter_map(|n| n.strip_suffix(".toml"))
            .filter(|n| validate_plugin_name(n).is_ok())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ConfigStore) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path(), StoreIo::new(Duration::from_secs(2)));
        (dir, store)
    }

    fn write_record(dir: &TempDir, plugin: &str, body: &str) {
        let path = dir.path().join("config");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(format!("{}.toml", plugin)), body).unwrap();
    }

    const VALID: &str = r#"
plugin = "cpu"
enabled = true
sensitivity = 2.5
window_size = 30
min_data_points = 12
"#;

    #[tokio::test]
    async fn first_reference_creates_defaults() {
        let (dir, store) = setup();
        let config = store.get("cpu").await.unwrap();
        assert_eq!(config, AnomalyConfig::default_for("cpu"));
        assert!(dir.path().join("config/cpu.toml").exists());
        assert_eq!(store.list_plugins().await.unwrap(), vec!["cpu".to_string()]);
    }

    #[tokio::test]
    async fn loads_record_and_fills_optional_fields() {
        let (dir, store) = setup();
        write_record(&dir, "cpu", VALID);

        let config = store.get("cpu").await.unwrap();
        assert_eq!(config.sensitivity, 2.5);
        assert_eq!(config.window_size, 30);
        assert_eq!(config.min_data_points, 12);
        assert_eq!(config.notification_threshold, 3);
        assert_eq!(config.cooldown_seconds, 1800);
    }

    #[tokio::test]
    async fn missing_required_key_is_reported() {
        let (dir, store) = setup();
        write_record(&dir, "cpu", "plugin = \"cpu\"\nenabled = true\nsensitivity = 2.0\nwindow_size = 20\n");

        let err = store.get("cpu").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::MissingKey { key: "min_data_points", .. })
        ));
    }

    #[tokio::test]
    async fn malformed_values_are_not_coerced() {
        let (dir, store) = setup();
        for bad in [
            VALID.replace("enabled = true", "enabled = \"yes\""),
            VALID.replace("sensitivity = 2.5", "sensitivity = \"abc\""),
            VALID.replace("sensitivity = 2.5", "sensitivity = -1.0"),
            VALID.replace("window_size = 30", "window_size = 2.5"),
            VALID.replace("sensitivity = 2.5", "sensitivity = 0"),
        ] {
            write_record(&dir, "cpu", &bad);
            let err = store.get("cpu").await.unwrap_err();
            assert!(
                matches!(err, Error::Validation(ValidationError::Malformed { .. })),
                "unexpected result for {}: {:?}",
                bad,
                err
            );
        }
    }

    #[tokio::test]
    async fn invariants_are_enforced() {
        let (dir, store) = setup();
        write_record(&dir, "cpu", &VALID.replace("min_data_points = 12", "min_data_points = 31"));
        assert!(matches!(
            store.get("cpu").await.unwrap_err(),
            Error::Validation(ValidationError::Invariant { .. })
        ));

        write_record(&dir, "cpu", &format!("{}notification_threshold = 0\n", VALID));
        assert!(matches!(
            store.get("cpu").await.unwrap_err(),
            Error::Validation(ValidationError::Malformed { .. })
        ));

        write_record(&dir, "cpu", &VALID.replace("plugin = \"cpu\"", "plugin = \"memory\""));
        assert!(matches!(
            store.get("cpu").await.unwrap_err(),
            Error::Validation(ValidationError::Invariant { .. })
        ));

        write_record(&dir, "cpu", &format!("{}colour = \"red\"\n", VALID));
        assert!(matches!(
            store.get("cpu").await.unwrap_err(),
            Error::Validation(ValidationError::UnknownKey { .. })
        ));
    }

    #[tokio::test]
    async fn bad_plugin_names_are_rejected() {
        let (_dir, store) = setup();
        assert!(store.get("../../etc/passwd").await.unwrap_err().is_validation());
        assert!(store.set("a b", "enabled", "true").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (_dir, store) = setup();
        store.get("cpu").await.unwrap();

        let updated = store.set("cpu", "sensitivity", "3.5").await.unwrap();
        assert_eq!(updated.sensitivity, 3.5);

        store.invalidate("cpu");
        let reloaded = store.get("cpu").await.unwrap();
        assert_eq!(reloaded, updated);

        // a fresh store instance sees the same record
        let other = ConfigStore::new(_dir.path(), StoreIo::new(Duration::from_secs(2)));
        assert_eq!(other.get("cpu").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn set_refreshes_cached_value() {
        let (_dir, store) = setup();
        assert!(store.get("cpu").await.unwrap().enabled);
        store.set("cpu", "enabled", "false").await.unwrap();
        assert!(!store.get("cpu").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn invalid_set_leaves_record_untouched() {
        let (dir, store) = setup();
        write_record(&dir, "cpu", VALID);
        let before = std::fs::read_to_string(dir.path().join("config/cpu.toml")).unwrap();

        assert!(store.set("cpu", "enabled", "maybe").await.is_err());
        assert!(store.set("cpu", "min_data_points", "100").await.is_err());
        assert!(store.set("cpu", "colour", "red").await.is_err());
        assert!(store.set("cpu", "plugin", "memory").await.is_err());

        let after = std::fs::read_to_string(dir.path().join("config/cpu.toml")).unwrap();
        assert_eq!(before, after);
        assert!(!dir.path().join("config/cpu.toml.bak").exists());
    }

    #[tokio::test]
    async fn failed_write_restores_the_backup() {
        let (dir, store) = setup();
        write_record(&dir, "cpu", VALID);
        let path = dir.path().join("config/cpu.toml");
        let before = std::fs::read(&path).unwrap();
        assert_eq!(store.get("cpu").await.unwrap().sensitivity, 2.5);

        // a directory where the temp file goes makes the atomic write fail
        std::fs::create_dir(dir.path().join("config/cpu.toml.tmp")).unwrap();
        let err = store.set("cpu", "sensitivity", "4.0").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(!dir.path().join("config/cpu.toml.bak").exists());
        assert_eq!(store.get("cpu").await.unwrap().sensitivity, 2.5);
    }

    #[tokio::test]
    async fn invalidate_all_picks_up_changes_from_another_store() {
        let (dir, store) = setup();
        assert!(store.get("cpu").await.unwrap().enabled);
        assert!(store.get("memory").await.unwrap().enabled);

        let other = ConfigStore::new(dir.path(), StoreIo::new(Duration::from_secs(2)));
        other.set("cpu", "enabled", "false").await.unwrap();
        other.set("memory", "window_size", "40").await.unwrap();
        assert!(store.get("cpu").await.unwrap().enabled);

        store.invalidate_all();
        assert!(!store.get("cpu").await.unwrap().enabled);
        assert_eq!(store.get("memory").await.unwrap().window_size, 40);
    }

    #[tokio::test]
    async fn set_repairs_a_broken_record() {
        let (dir, store) = setup();
        write_record(&dir, "cpu", &VALID.replace("enabled = true", "enabled = \"yes\""));
        assert!(store.get("cpu").await.is_err());

        let fixed = store.set("cpu", "enabled", "false").await.unwrap();
        assert!(!fixed.enabled);
        assert_eq!(fixed.window_size, 30);
        assert!(!dir.path().join("config/cpu.toml.bak").exists());
    }

    #[tokio::test]
    async fn create_defaults_is_idempotent_and_never_overwrites() {
        let (dir, store) = setup();
        write_record(&dir, "cpu", VALID);

        let plugins = vec!["cpu".to_string(), "memory".to_string()];
        let created = store.create_defaults(&plugins).await.unwrap();
        assert_eq!(created, vec!["memory".to_string()]);
        assert!(store.create_defaults(&plugins).await.unwrap().is_empty());

        assert_eq!(store.get("cpu").await.unwrap().sensitivity, 2.5);
        assert_eq!(store.get("memory").await.unwrap(), AnomalyConfig::default_for("memory"));
        assert_eq!(store.list_plugins().await.unwrap(), plugins);
    }

    #[tokio::test]
    async fn syntax_errors_are_storage_corruption() {
        let (dir, store) = setup();
        write_record(&dir, "cpu", "plugin = \n");
        assert!(matches!(
            store.get("cpu").await.unwrap_err(),
            Error::Storage(StorageError::Corrupt { .. })
        ));
    }
}
