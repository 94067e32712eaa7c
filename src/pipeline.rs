//! Per-sample detection flow and the per-cycle fan-out across plugins.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerter::Notifier;
use crate::analyzer::{Detector, Evaluation};
use crate::config::Config;
use crate::debounce::{DebouncePolicy, NotificationDebouncer, Phase};
use crate::error::{Result, ValidationError};
use crate::store::{ConfigStore, KeyedLocks, ResultRecorder, StoreIo, TimeSeriesStore};
use crate::types::{DetectionResult, PluginSample};

/// The durable stores, opened once per process and shared by every task.
#[derive(Clone)]
pub struct Stores {
    pub configs: Arc<ConfigStore>,
    pub series: Arc<TimeSeriesStore>,
    pub recorder: Arc<ResultRecorder>,
    pub debouncer: Arc<NotificationDebouncer>,
}

impl Stores {
    pub fn open(data_dir: &Path, io_timeout: Duration) -> Self {
        let io = StoreIo::new(io_timeout);
        Self {
            configs: Arc::new(ConfigStore::new(data_dir, io)),
            series: Arc::new(TimeSeriesStore::new(data_dir, io)),
            recorder: Arc::new(ResultRecorder::new(data_dir, io)),
            debouncer: Arc::new(NotificationDebouncer::new(data_dir, io)),
        }
    }
}

/// What happened to the notification side of an evaluated sample
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NotAnomalous,
    Suppressed(Phase),
    Sent,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Disabled,
    WarmingUp { available: usize, required: usize },
    Evaluated { result: DetectionResult, notification: Notification },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginFailure {
    pub plugin: String,
    pub error: String,
    /// Samples of the batch left unprocessed after the failure
    pub skipped: usize,
}

/// Tally of one processing cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub plugins: usize,
    pub processed: usize,
    pub disabled: usize,
    pub warming_up: usize,
    pub anomalies: usize,
    pub notifications_sent: usize,
    pub notification_failures: usize,
    pub failed_plugins: Vec<PluginFailure>,
}

impl CycleReport {
    fn count(&mut self, outcome: &SampleOutcome) {
        match outcome {
            SampleOutcome::Disabled => self.disabled += 1,
            SampleOutcome::WarmingUp { .. } => self.warming_up += 1,
            SampleOutcome::Evaluated { result, notification } => {
                self.processed += 1;
                if result.is_anomaly {
                    self.anomalies += 1;
                }
                match notification {
                    Notification::Sent => self.notifications_sent += 1,
                    Notification::Failed(_) => self.notification_failures += 1,
                    Notification::NotAnomalous | Notification::Suppressed(_) => {}
                }
            }
        }
    }

    fn merge(&mut self, other: CycleReport) {
        self.plugins += other.plugins;
        self.processed += other.processed;
        self.disabled += other.disabled;
        self.warming_up += other.warming_up;
        self.anomalies += other.anomalies;
        self.notifications_sent += other.notifications_sent;
        self.notification_failures += other.notification_failures;
        self.failed_plugins.extend(other.failed_plugins);
    }
}

struct Inner {
    stores: Stores,
    detector: Detector,
    notifier: Arc<dyn Notifier>,
    hostname: String,
    max_workers: usize,
    plugin_locks: KeyedLocks<String>,
}

/// Cheap to clone; clones share stores, locks and notifier.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        stores: Stores,
        detector: Detector,
        notifier: Arc<dyn Notifier>,
        hostname: &str,
        max_workers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stores,
                detector,
                notifier,
                hostname: hostname.to_string(),
                max_workers: max_workers.max(1),
                plugin_locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn from_config(config: &Config, notifier: Arc<dyn Notifier>) -> Self {
        Self::new(
            Stores::open(&config.agent.data_dir, config.storage.io_timeout()),
            Detector::new(&config.analyzer),
            notifier,
            &config.agent.hostname,
            config.storage.max_workers,
        )
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    /// Run one sample through detection, recording and debouncing.
    pub async fn process_sample(&self, sample: &PluginSample, now: DateTime<Utc>) -> Result<SampleOutcome> {
        let _plugin = self.inner.plugin_locks.lock(&sample.plugin).await;
        self.process_locked(sample, now).await
    }

    async fn process_locked(&self, sample: &PluginSample, now: DateTime<Utc>) -> Result<SampleOutcome> {
        check_finite(sample)?;
        let stores = &self.inner.stores;
        let plugin = sample.plugin.as_str();
        let metric = sample.metric.as_str();

        let config = stores.configs.get(plugin).await?;
        if !config.enabled {
            debug!(plugin, "Plugin disabled, sample ignored");
            return Ok(SampleOutcome::Disabled);
        }

        let mut history = stores.series.load(plugin, metric).await?;
        // a window shrunk since the last append leaves extra points behind
        if history.len() > config.window_size {
            history.drain(..history.len() - config.window_size);
        }
        stores.series.append(plugin, metric, sample.point(), config.window_size).await?;

        let result = match self.inner.detector.detect(&history, sample, &config) {
            Evaluation::InsufficientData { available, required } => {
                debug!(plugin, metric, available, required, "Warming up");
                return Ok(SampleOutcome::WarmingUp { available, required });
            }
            Evaluation::Evaluated(result) => result,
        };

        stores.recorder.persist(&result).await?;

        let policy = DebouncePolicy::from(&config);
        let state = stores.debouncer.record(plugin, result.is_anomaly, now, &policy).await?;
        if !result.is_anomaly {
            return Ok(SampleOutcome::Evaluated { result, notification: Notification::NotAnomalous });
        }

        let phase = state.phase(now, &policy);
        if phase != Phase::Armed {
            debug!(
                plugin,
                metric,
                %phase,
                count = state.consecutive_anomaly_count,
                "Anomaly recorded, notification suppressed"
            );
            return Ok(SampleOutcome::Evaluated { result, notification: Notification::Suppressed(phase) });
        }

        let (message, context) = format_message(&self.inner.hostname, &result);
        let notification = match self.inner.notifier.send(&message, result.confidence.severity(), &context).await {
            Ok(()) => {
                stores.debouncer.notified(plugin, now).await?;
                info!(plugin, metric, score = result.anomaly_score, "Anomaly notification sent");
                Notification::Sent
            }
            Err(e) => {
                warn!(plugin, metric, error = %e, "Anomaly notification failed, will retry on next anomaly");
                Notification::Failed(e.to_string())
            }
        };

        Ok(SampleOutcome::Evaluated { result, notification })
    }

    /// Process every plugin's samples concurrently, one task per plugin.
    /// Config and debounce state are reread from disk at the start of every
    /// cycle, so changes made by other processes apply to the next cycle.
    pub async fn run_cycle(&self, samples: Vec<PluginSample>, now: DateTime<Utc>) -> CycleReport {
        self.inner.stores.configs.invalidate_all();
        self.inner.stores.debouncer.forget_all();

        let mut batches: BTreeMap<String, Vec<PluginSample>> = BTreeMap::new();
        for sample in samples {
            batches.entry(sample.plugin.clone()).or_default().push(sample);
        }

        let mut report = CycleReport::default();
        if batches.is_empty() {
            return report;
        }

        let permits = Arc::new(Semaphore::new(batches.len().min(self.inner.max_workers)));
        let mut tasks: Vec<(String, usize, JoinHandle<CycleReport>)> = Vec::with_capacity(batches.len());
        for (plugin, batch) in batches {
            let pipeline = self.clone();
            let permits = permits.clone();
            let name = plugin.clone();
            let size = batch.len();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                pipeline.process_batch(name, batch, now).await
            });
            tasks.push((plugin, size, handle));
        }

        for (plugin, size, handle) in tasks {
            match handle.await {
                Ok(batch) => report.merge(batch),
                Err(e) => {
                    error!(plugin = %plugin, error = %e, "Plugin task aborted");
                    report.plugins += 1;
                    report.failed_plugins.push(PluginFailure { plugin, error: e.to_string(), skipped: size });
                }
            }
        }

        info!(
            plugins = report.plugins,
            processed = report.processed,
            warming_up = report.warming_up,
            anomalies = report.anomalies,
            sent = report.notifications_sent,
            failed = report.failed_plugins.len(),
            "Cycle complete"
        );
        report
    }

    async fn process_batch(&self, plugin: String, batch: Vec<PluginSample>, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport { plugins: 1, ..Default::default() };
        let _plugin = self.inner.plugin_locks.lock(&plugin).await;

        let total = batch.len();
        for (i, sample) in batch.iter().enumerate() {
            match self.process_locked(sample, now).await {
                Ok(outcome) => report.count(&outcome),
                Err(e) => {
                    let skipped = total - i - 1;
                    if e.is_validation() {
                        error!(plugin = %plugin, error = %e, skipped, "Plugin rejected, rest of its batch skipped");
                    } else {
                        error!(plugin = %plugin, error = %e, skipped, "Plugin processing failed");
                    }
                    report.failed_plugins.push(PluginFailure { plugin: plugin.clone(), error: e.to_string(), skipped });
                    break;
                }
            }
        }
        report
    }

    /// Evaluate `sample` against the current history without storing,
    /// recording or notifying anything.
    pub async fn dry_run(&self, sample: &PluginSample) -> Result<Evaluation> {
        check_finite(sample)?;
        let _plugin = self.inner.plugin_locks.lock(&sample.plugin).await;
        let stores = &self.inner.stores;

        let config = stores.configs.get(&sample.plugin).await?;
        let mut history = stores.series.load(&sample.plugin, &sample.metric).await?;
        if history.len() > config.window_size {
            history.drain(..history.len() - config.window_size);
        }
        Ok(self.inner.detector.detect(&history, sample, &config))
    }
}

/// NaN and infinities cannot be stored as JSON numbers.
fn check_finite(sample: &PluginSample) -> Result<()> {
    if sample.value.is_finite() {
        return Ok(());
    }
    Err(ValidationError::NonFiniteValue {
        plugin: sample.plugin.clone(),
        metric: sample.metric.clone(),
        value: sample.value,
    }
    .into())
}

/// Human-readable message plus the same facts as a flat context map.
pub fn format_message(hostname: &str, result: &DetectionResult) -> (String, BTreeMap<String, String>) {
    let severity = result.confidence.severity();
    let tags = result.tags_label();
    let timestamp = result.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);

    let message = format!(
        "[{}] Anomaly on {}: {}/{} = {:.2} (score {:.2}, type {}, confidence {}) at {}",
        severity,
        hostname,
        result.plugin,
        result.metric,
        result.current_value,
        result.anomaly_score,
        tags,
        result.confidence,
        timestamp,
    );

    let mut context = BTreeMap::new();
    context.insert("hostname".to_string(), hostname.to_string());
    context.insert("plugin".to_string(), result.plugin.clone());
    context.insert("metric".to_string(), result.metric.clone());
    context.insert("value".to_string(), format!("{:.2}", result.current_value));
    context.insert("score".to_string(), format!("{:.2}", result.anomaly_score));
    context.insert("anomaly_type".to_string(), tags);
    context.insert("confidence".to_string(), result.confidence.to_string());
    context.insert("mean".to_string(), format!("{:.2}", result.statistics.mean));
    context.insert("std_dev".to_string(), format!("{:.2}", result.statistics.std_dev));
    context.insert("timestamp".to_string(), timestamp);

    (message, context)
}
