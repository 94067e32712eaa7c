use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use anomaly_agent::alerter::Notifier;
use anomaly_agent::analyzer::Detector;
use anomaly_agent::config::AnalyzerConfig;
use anomaly_agent::debounce::Phase;
use anomaly_agent::error::{Error, TransportError, ValidationError};
use anomaly_agent::pipeline::{Notification, Pipeline, SampleOutcome, Stores};
use anomaly_agent::store::{ConfigStore, StoreIo};
use anomaly_agent::types::{AnomalyTag, PluginSample, Severity};

#[derive(Default)]
struct RecordingNotifier {
    fail: AtomicBool,
    sent: Mutex<Vec<(String, Severity, BTreeMap<String, String>)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        message: &str,
        severity: Severity,
        context: &BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Channel { channel: "test".into(), reason: "unreachable".into() });
        }
        self.sent.lock().unwrap().push((message.to_string(), severity, context.clone()));
        Ok(())
    }
}

fn setup() -> (TempDir, Pipeline, Arc<RecordingNotifier>) {
    let dir = TempDir::new().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = Pipeline::new(
        Stores::open(dir.path(), Duration::from_secs(2)),
        Detector::new(&AnalyzerConfig::default()),
        notifier.clone(),
        "web-01",
        4,
    );
    (dir, pipeline, notifier)
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

async fn feed(pipeline: &Pipeline, value: f64, secs: i64) -> SampleOutcome {
    let sample = PluginSample::new("cpu", "usage_percent", value, at(secs));
    pipeline.process_sample(&sample, at(secs)).await.unwrap()
}

fn notification(outcome: &SampleOutcome) -> &Notification {
    match outcome {
        SampleOutcome::Evaluated { notification, .. } => notification,
        other => panic!("expected an evaluated sample, got {:?}", other),
    }
}

async fn warm_up(pipeline: &Pipeline) {
    for i in 0..10 {
        let value = if i % 2 == 0 { 49.0 } else { 51.0 };
        let outcome = feed(pipeline, value, i * 60).await;
        assert!(matches!(outcome, SampleOutcome::WarmingUp { required: 10, .. }));
    }
}

#[tokio::test]
async fn debounces_then_notifies_then_cools_down() {
    let (dir, pipeline, notifier) = setup();
    warm_up(&pipeline).await;

    let first = feed(&pipeline, 80.0, 600).await;
    assert_eq!(notification(&first), &Notification::Suppressed(Phase::Accumulating));
    let second = feed(&pipeline, 120.0, 660).await;
    assert_eq!(notification(&second), &Notification::Suppressed(Phase::Accumulating));

    let third = feed(&pipeline, 200.0, 720).await;
    assert_eq!(notification(&third), &Notification::Sent);
    {
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (message, severity, context) = &sent[0];
        assert!(message.starts_with("[HIGH] Anomaly on web-01: cpu/usage_percent = 200.00"));
        assert_eq!(*severity, Severity::High);
        assert_eq!(context["plugin"], "cpu");
        assert_eq!(context["value"], "200.00");
    }

    let cooling = feed(&pipeline, 400.0, 780).await;
    assert_eq!(notification(&cooling), &Notification::Suppressed(Phase::Cooling));

    // cooldown (1800s) over: a new streak starts from one
    let after = feed(&pipeline, 800.0, 720 + 1801).await;
    assert_eq!(notification(&after), &Notification::Suppressed(Phase::Accumulating));
    assert_eq!(notifier.sent.lock().unwrap().len(), 1);

    let history = pipeline.stores().series.load("cpu", "usage_percent").await.unwrap();
    assert_eq!(history.len(), 15);
    let results = pipeline.stores().recorder.load_day("cpu", at(0).date_naive()).await.unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.is_anomaly));
    assert!(results.iter().all(|r| r.has_tag(AnomalyTag::Statistical)));
    assert!(dir.path().join("state/cpu.json").exists());
    assert!(dir.path().join("config/cpu.toml").exists());
}

#[tokio::test]
async fn normal_sample_resets_the_streak() {
    let (_dir, pipeline, notifier) = setup();
    warm_up(&pipeline).await;

    feed(&pipeline, 80.0, 600).await;
    feed(&pipeline, 120.0, 660).await;
    let normal = feed(&pipeline, 51.0, 720).await;
    assert_eq!(notification(&normal), &Notification::NotAnomalous);

    let again = feed(&pipeline, 300.0, 780).await;
    assert_eq!(notification(&again), &Notification::Suppressed(Phase::Accumulating));
    assert!(notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_delivery_retries_on_next_anomaly() {
    let (_dir, pipeline, notifier) = setup();
    warm_up(&pipeline).await;
    notifier.fail.store(true, Ordering::SeqCst);

    feed(&pipeline, 80.0, 600).await;
    feed(&pipeline, 120.0, 660).await;
    let failed = feed(&pipeline, 200.0, 720).await;
    assert!(matches!(notification(&failed), Notification::Failed(_)));

    let debouncer = &pipeline.stores().debouncer;
    let state = debouncer.state("cpu").await.unwrap();
    assert_eq!(state.consecutive_anomaly_count, 3);
    assert_eq!(state.last_notification, None);

    notifier.fail.store(false, Ordering::SeqCst);
    let retried = feed(&pipeline, 400.0, 780).await;
    assert_eq!(notification(&retried), &Notification::Sent);
    assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    assert_eq!(debouncer.state("cpu").await.unwrap().last_notification, Some(at(780)));
}

#[tokio::test]
async fn cycle_isolates_a_misconfigured_plugin() {
    let (dir, pipeline, _) = setup();
    std::fs::create_dir_all(dir.path().join("config")).unwrap();
    std::fs::write(
        dir.path().join("config/memory.toml"),
        "plugin = \"memory\"\nenabled = true\nsensitivity = 2.0\nwindow_size = 5\nmin_data_points = 10\n",
    )
    .unwrap();

    let samples = vec![
        PluginSample::new("memory", "usage_percent", 40.0, at(0)),
        PluginSample::new("cpu", "usage_percent", 10.0, at(0)),
        PluginSample::new("memory", "usage_percent", 41.0, at(1)),
        PluginSample::new("cpu", "usage_percent", 11.0, at(1)),
        PluginSample::new("memory", "usage_percent", 42.0, at(2)),
    ];
    let report = pipeline.run_cycle(samples, at(5)).await;

    assert_eq!(report.plugins, 2);
    assert_eq!(report.warming_up, 2);
    assert_eq!(report.failed_plugins.len(), 1);
    assert_eq!(report.failed_plugins[0].plugin, "memory");
    assert_eq!(report.failed_plugins[0].skipped, 2);

    assert_eq!(pipeline.stores().series.load("cpu", "usage_percent").await.unwrap().len(), 2);
    assert!(pipeline.stores().series.load("memory", "usage_percent").await.unwrap().is_empty());
}

#[tokio::test]
async fn state_is_reloaded_from_disk_between_runs() {
    let dir = TempDir::new().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let open = || {
        Pipeline::new(
            Stores::open(dir.path(), Duration::from_secs(2)),
            Detector::new(&AnalyzerConfig::default()),
            notifier.clone(),
            "web-01",
            2,
        )
    };

    // one process per sample, as under an external scheduler
    for i in 0..10 {
        let value = if i % 2 == 0 { 49.0 } else { 51.0 };
        feed(&open(), value, i * 60).await;
    }
    feed(&open(), 80.0, 600).await;
    feed(&open(), 120.0, 660).await;
    let third = feed(&open(), 200.0, 720).await;

    assert_eq!(notification(&third), &Notification::Sent);
    assert_eq!(notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unbounded_cooldown_keeps_cooling() {
    let (_dir, pipeline, notifier) = setup();
    pipeline
        .stores()
        .configs
        .set("cpu", "cooldown_seconds", &i64::MAX.to_string())
        .await
        .unwrap();
    warm_up(&pipeline).await;

    feed(&pipeline, 80.0, 600).await;
    feed(&pipeline, 120.0, 660).await;
    assert_eq!(notification(&feed(&pipeline, 200.0, 720).await), &Notification::Sent);

    let much_later = feed(&pipeline, 400.0, 720 + 50 * 365 * 86_400).await;
    assert_eq!(notification(&much_later), &Notification::Suppressed(Phase::Cooling));
    assert_eq!(notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn each_cycle_rereads_config_and_state() {
    let (dir, pipeline, _) = setup();
    let report = pipeline.run_cycle(vec![PluginSample::new("cpu", "usage_percent", 10.0, at(0))], at(0)).await;
    assert_eq!(report.warming_up, 1);

    // another invocation of the agent changes the setting on disk
    let other = ConfigStore::new(dir.path(), StoreIo::new(Duration::from_secs(2)));
    other.set("cpu", "enabled", "false").await.unwrap();

    let report = pipeline.run_cycle(vec![PluginSample::new("cpu", "usage_percent", 11.0, at(60))], at(60)).await;
    assert_eq!(report.disabled, 1);
    assert_eq!(report.warming_up, 0);
    assert_eq!(pipeline.stores().series.load("cpu", "usage_percent").await.unwrap().len(), 1);
}

#[tokio::test]
async fn non_finite_values_are_rejected() {
    let (_dir, pipeline, _) = setup();
    feed(&pipeline, 1.0, 0).await;

    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let sample = PluginSample::new("cpu", "usage_percent", bad, at(60));
        let err = pipeline.process_sample(&sample, at(60)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NonFiniteValue { .. })));
        assert!(pipeline.dry_run(&sample).await.unwrap_err().is_validation());
    }

    let outcome = feed(&pipeline, 1.0, 120).await;
    assert!(matches!(outcome, SampleOutcome::WarmingUp { available: 1, .. }));
    assert_eq!(pipeline.stores().series.load("cpu", "usage_percent").await.unwrap().len(), 2);
}

struct PanickingNotifier;

#[async_trait]
impl Notifier for PanickingNotifier {
    async fn send(
        &self,
        _message: &str,
        _severity: Severity,
        _context: &BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        panic!("notifier blew up");
    }
}

#[tokio::test]
async fn crashed_plugin_task_is_reported_by_name() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(
        Stores::open(dir.path(), Duration::from_secs(2)),
        Detector::new(&AnalyzerConfig::default()),
        Arc::new(PanickingNotifier),
        "web-01",
        4,
    );
    pipeline.stores().configs.set("cpu", "notification_threshold", "1").await.unwrap();
    warm_up(&pipeline).await;

    let samples = vec![
        PluginSample::new("cpu", "usage_percent", 200.0, at(600)),
        PluginSample::new("memory", "usage_percent", 40.0, at(600)),
    ];
    let report = pipeline.run_cycle(samples, at(600)).await;

    assert_eq!(report.plugins, 2);
    assert_eq!(report.warming_up, 1);
    assert_eq!(report.failed_plugins.len(), 1);
    assert_eq!(report.failed_plugins[0].plugin, "cpu");
    assert_eq!(report.failed_plugins[0].skipped, 1);
}
