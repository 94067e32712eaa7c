//! Consecutive-anomaly counting with a per-plugin cooldown.
//!
//! A plugin moves Normal -> Accumulating -> Armed as anomalous samples arrive
//! back to back, fires once when Armed, then sits in Cooling until
//! `cooldown_seconds` have elapsed. Anomalies seen while Cooling are not
//! counted. A failed delivery leaves the plugin Armed so the next anomalous
//! sample retries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::store::{retry_once, validate_plugin_name, AnomalyConfig, StoreIo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Normal,
    Accumulating,
    Armed,
    Cooling,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Normal => "normal",
            Phase::Accumulating => "accumulating",
            Phase::Armed => "armed",
            Phase::Cooling => "cooling",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebouncePolicy {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl From<&AnomalyConfig> for DebouncePolicy {
    fn from(config: &AnomalyConfig) -> Self {
        Self {
            threshold: config.notification_threshold.max(1),
            cooldown: i64::try_from(config.cooldown_seconds)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX),
        }
    }
}

/// Durable per-plugin debounce state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationState {
    pub consecutive_anomaly_count: u32,
    pub last_notification: Option<DateTime<Utc>>,
}

impl NotificationState {
    pub fn is_cooling(&self, now: DateTime<Utc>, policy: &DebouncePolicy) -> bool {
        self.last_notification
            .map_or(false, |last| now - last < policy.cooldown)
    }

    pub fn phase(&self, now: DateTime<Utc>, policy: &DebouncePolicy) -> Phase {
        if self.is_cooling(now, policy) {
            Phase::Cooling
        } else if self.consecutive_anomaly_count >= policy.threshold {
            Phase::Armed
        } else if self.consecutive_anomaly_count > 0 {
            Phase::Accumulating
        } else {
            Phase::Normal
        }
    }

    pub fn record(&mut self, is_anomaly: bool, now: DateTime<Utc>, policy: &DebouncePolicy) {
        if !is_anomaly {
            self.consecutive_anomaly_count = 0;
        } else if !self.is_cooling(now, policy) {
            self.consecutive_anomaly_count = self.consecutive_anomaly_count.saturating_add(1);
        }
    }

    pub fn should_notify(&self, now: DateTime<Utc>, policy: &DebouncePolicy) -> bool {
        self.phase(now, policy) == Phase::Armed
    }

    pub fn notified(&mut self, now: DateTime<Utc>) {
        self.consecutive_anomaly_count = 0;
        self.last_notification = Some(now);
    }
}

/// Per-plugin [`NotificationState`], cached in memory and mirrored to
/// `<data_dir>/state/<plugin>.json` after every change.
pub struct NotificationDebouncer {
    dir: PathBuf,
    io: StoreIo,
    states: Mutex<HashMap<String, NotificationState>>,
}

impl NotificationDebouncer {
    pub fn new(data_dir: &Path, io: StoreIo) -> Self {
        Self {
            dir: data_dir.join("state"),
            io,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, plugin: &str) -> PathBuf {
        self.dir.join(format!("{}.json", plugin))
    }

    fn cached(&self, plugin: &str) -> Option<NotificationState> {
        let states = self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        states.get(plugin).cloned()
    }

    fn remember(&self, plugin: &str, state: NotificationState) {
        let mut states = self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        states.insert(plugin.to_string(), state);
    }

    /// Drop every cached state so the next reference rereads disk.
    pub fn forget_all(&self) {
        let mut states = self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        states.clear();
    }

    /// Current state, loaded from disk on first reference.
    pub async fn state(&self, plugin: &str) -> Result<NotificationState> {
        validate_plugin_name(plugin)?;
        if let Some(state) = self.cached(plugin) {
            return Ok(state);
        }

        let path = self.path(plugin);
        let state = match retry_once("state load", || self.io.read_optional(&path)).await? {
            None => NotificationState::default(),
            Some(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(plugin, path = %path.display(), error = %e, "Corrupt notification state, starting over");
                NotificationState::default()
            }),
        };
        self.remember(plugin, state.clone());
        Ok(state)
    }

    /// Persist first, then publish to the cache, so memory never runs ahead
    /// of what a restart would see.
    async fn save(&self, plugin: &str, state: NotificationState) -> Result<NotificationState> {
        let body = serde_json::to_vec_pretty(&state).map_err(StorageError::from)?;
        let path = self.path(plugin);
        retry_once("state save", || self.io.write_atomic(&path, &body)).await?;
        self.remember(plugin, state.clone());
        Ok(state)
    }

    pub async fn record(
        &self,
        plugin: &str,
        is_anomaly: bool,
        now: DateTime<Utc>,
        policy: &DebouncePolicy,
    ) -> Result<NotificationState> {
        let mut state = self.state(plugin).await?;
        let before = state.clone();
        state.record(is_anomaly, now, policy);
        if state == before {
            return Ok(state);
        }
        debug!(plugin, count = state.consecutive_anomaly_count, "Anomaly streak updated");
        self.save(plugin, state).await
    }

    pub async fn should_notify(&self, plugin: &str, now: DateTime<Utc>, policy: &DebouncePolicy) -> Result<bool> {
        Ok(self.state(plugin).await?.should_notify(now, policy))
    }

    pub async fn phase(&self, plugin: &str, now: DateTime<Utc>, policy: &DebouncePolicy) -> Result<Phase> {
        Ok(self.state(plugin).await?.phase(now, policy))
    }

    /// Mark a delivered notification: resets the streak and starts cooling.
    pub async fn notified(&self, plugin: &str, now: DateTime<Utc>) -> Result<NotificationState> {
        let mut state = self.state(plugin).await?;
        state.notified(now);
        self.save(plugin, state).await
    }
}
