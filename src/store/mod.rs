//! Flat-file persistence for plugin configs, metric history, detection
//! results and notification state.
//!
//! Every operation runs under a bounded timeout. Rewrites go through a temp
//! file and a rename, appends are single-line writes, so a cycle abandoned
//! half-way never leaves a record in a state the next load cannot handle.

pub mod config_store;
pub mod results;
pub mod series;

pub use config_store::{AnomalyConfig, ConfigStore};
pub use results::{PluginSummary, ResultRecorder};
pub use series::TimeSeriesStore;

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncWriteExt;

use crate::error::{StorageError, ValidationError};

/// Timeout-bounded filesystem access shared by all stores.
#[derive(Debug, Clone, Copy)]
pub struct StoreIo {
    timeout: Duration,
}

impl StoreIo {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn bounded<T, F>(&self, op: &'static str, path: &Path, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(StorageError::Io { op, path: path.to_path_buf(), source }),
            Err(_) => Err(StorageError::Timeout {
                op,
                path: path.to_path_buf(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// File contents, or `None` when the file does not exist.
    pub async fn read_optional(&self, path: &Path) -> Result<Option<String>, StorageError> {
        self.bounded("read", path, async {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => Ok(Some(content)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        self.bounded("stat", path, tokio::fs::try_exists(path)).await
    }

    /// Replace `path` with `contents` via a sibling temp file and a rename.
    pub async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), StorageError> {
        let tmp = sibling(path, "tmp");
        self.bounded("write", &tmp, async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(contents).await?;
            file.sync_all().await?;
            Ok(())
        })
        .await?;
        self.bounded("rename", path, tokio::fs::rename(&tmp, path)).await
    }

    /// Append one newline-terminated line, creating the file and its parents.
    pub async fn append_line(&self, path: &Path, line: &str) -> Result<(), StorageError> {
        self.bounded("append", path, async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            let mut buf = String::with_capacity(line.len() + 1);
            buf.push_str(line);
            buf.push('\n');
            file.write_all(buf.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
        .await
    }

    pub async fn copy(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        self.bounded("copy", to, async { tokio::fs::copy(from, to).await.map(|_| ()) }).await
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        self.bounded("rename", to, tokio::fs::rename(from, to)).await
    }

    pub async fn remove_if_exists(&self, path: &Path) -> Result<bool, StorageError> {
        self.bounded("remove", path, async {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Entry names in `dir`, sorted. A missing directory has no entries.
    pub async fn list_dir(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        self.bounded("list", dir, async {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
            names.sort();
            Ok(names)
        })
        .await
    }
}

impl StorageError {
    /// I/O failures and timeouts may succeed on a second attempt; bad data won't.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io { .. } | StorageError::Timeout { .. })
    }
}

/// Run an idempotent storage operation, retrying once on a transient failure.
pub async fn retry_once<T, F, Fut>(op: &'static str, mut attempt: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    match attempt().await {
        Err(err) if err.is_transient() => {
            tracing::warn!(op, error = %err, "Storage operation failed, retrying once");
            attempt().await
        }
        other => other,
    }
}

/// `path` with `.suffix` appended to its file name (`a.toml` -> `a.toml.tmp`)
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// One async mutex per key, created on first use.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }

    pub async fn lock(&self, key: &K) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_plugin_name(name: &str) -> Result<(), ValidationError> {
    static PLUGIN_NAME: OnceLock<Regex> = OnceLock::new();
    let re = PLUGIN_NAME.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid plugin pattern"));
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidPluginName(name.to_string()))
    }
}

pub fn validate_metric_name(name: &str) -> Result<(), ValidationError> {
    static METRIC_NAME: OnceLock<Regex> = OnceLock::new();
    let re = METRIC_NAME.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_.-]+$").expect("valid metric pattern"));
    // "." and ".." would escape the plugin directory
    if re.is_match(name) && name.chars().any(|c| c != '.') {
        Ok(())
    } else {
        Err(ValidationError::InvalidMetricName(name.to_string()))
    }
}
