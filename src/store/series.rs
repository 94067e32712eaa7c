use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::types::DataPoint;
use super::{retry_once, validate_metric_name, validate_plugin_name, KeyedLocks, StoreIo};

/// Bounded per-(plugin, metric) history, one JSON line per point under
/// `<data_dir>/history/<plugin>/<metric>.log`, oldest first.
pub struct TimeSeriesStore {
    dir: PathBuf,
    io: StoreIo,
    writers: KeyedLocks<(String, String)>,
}

struct SeriesContents {
    points: Vec<DataPoint>,
    /// no torn or unreadable lines, safe to append to
    clean: bool,
}

impl TimeSeriesStore {
    pub fn new(data_dir: &Path, io: StoreIo) -> Self {
        Self {
            dir: data_dir.join("history"),
            io,
            writers: KeyedLocks::new(),
        }
    }

    fn path(&self, plugin: &str, metric: &str) -> PathBuf {
        self.dir.join(plugin).join(format!("{}.log", metric))
    }

    async fn read(&self, path: &Path) -> Result<SeriesContents> {
        let content = retry_once("series load", || self.io.read_optional(path)).await?;
        let Some(content) = content else {
            return Ok(SeriesContents { points: Vec::new(), clean: true });
        };

        let mut points = Vec::new();
        let mut skipped = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<DataPoint>(line) {
                Ok(point) => points.push(point),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "Skipped unreadable history lines");
        }

        let clean = skipped == 0 && (content.is_empty() || content.ends_with('\n'));
        Ok(SeriesContents { points, clean })
    }

    /// Retained points in time order, oldest first. Empty when the series
    /// has no history yet.
    pub async fn load(&self, plugin: &str, metric: &str) -> Result<Vec<DataPoint>> {
        validate_plugin_name(plugin)?;
        validate_metric_name(metric)?;
        Ok(self.read(&self.path(plugin, metric)).await?.points)
    }

    /// Append `point` and keep only the newest `window_size` points.
    /// Returns the number of retained points.
    pub async fn append(&self, plugin: &str, metric: &str, point: DataPoint, window_size: usize) -> Result<usize> {
        validate_plugin_name(plugin)?;
        validate_metric_name(metric)?;
        let window_size = window_size.max(1);

        let _writer = self.writers.lock(&(plugin.to_string(), metric.to_string())).await;
        let path = self.path(plugin, metric);
        let SeriesContents { mut points, clean } = self.read(&path).await?;

        if clean && points.len() < window_size {
            let line = serde_json::to_string(&point).map_err(StorageError::from)?;
            self.io.append_line(&path, &line).await?;
            return Ok(points.len() + 1);
        }

        // Over the bound or damaged: rewrite the whole series.
        points.push(point);
        let evicted = points.len().saturating_sub(window_size);
        let kept = &points[evicted..];

        let mut body = String::new();
        for p in kept {
            body.push_str(&serde_json::to_string(p).map_err(StorageError::from)?);
            body.push('\n');
        }
        retry_once("series compact", || self.io.write_atomic(&path, body.as_bytes())).await?;

        debug!(plugin, metric, evicted, retained = kept.len(), "Compacted series");
        Ok(kept.len())
    }
}
