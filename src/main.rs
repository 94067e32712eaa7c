use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

use anomaly_agent::alerter::AlertManager;
use anomaly_agent::analyzer::{trend, Evaluation};
use anomaly_agent::collector;
use anomaly_agent::config::Config;
use anomaly_agent::pipeline::{CycleReport, Pipeline};
use anomaly_agent::types::AnomalyTag;

#[derive(Parser, Debug)]
#[command(name = "anomaly-agent", about = "Anomaly detection and alert debouncing for host metrics")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/anomaly-agent/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect once, run one detection cycle and exit (default)
    Run,
    /// Run a cycle every INTERVAL seconds until interrupted
    Watch {
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Show plugin anomaly settings
    List,
    /// Collect and evaluate without recording or notifying
    Test {
        plugin: Option<String>,
    },
    /// Summarize recent detections
    Summary {
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long)]
        plugin: Option<String>,
    },
    /// Change one setting of a plugin
    Set {
        plugin: String,
        key: String,
        value: String,
    },
    /// Write default settings for the configured plugins
    Init,
    /// Delete result logs past the retention period
    Cleanup,
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("anomaly-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    init_logging(&config);

    let command = cli.command.unwrap_or(Command::Run);
    if let Err(e) = dispatch(config, command).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(&config.agent.log_level)
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let alerter = AlertManager::new(&config.alerting, &config.agent.hostname)
        .context("Failed to initialize alert channels")?;
    Ok(Pipeline::from_config(config, Arc::new(alerter)))
}

async fn dispatch(config: Config, command: Command) -> Result<()> {
    let pipeline = build_pipeline(&config)?;
    let stores = pipeline.stores().clone();

    match command {
        Command::Run => {
            info!(hostname = %config.agent.hostname, "Starting detection cycle");
            let report = run_once(&config, &pipeline).await;
            print_report(&report);
        }
        Command::Watch { interval } => watch(&config, &pipeline, interval).await?,
        Command::List => {
            let plugins = stores.configs.list_plugins().await?;
            if plugins.is_empty() {
                println!("No plugins configured. Run `anomaly-agent init` first.");
            }
            for plugin in plugins {
                match stores.configs.get(&plugin).await {
                    Ok(c) => println!(
                        "{:<16} enabled={} sensitivity={} window={} min_points={} patterns={} spikes={} trends={} threshold={} cooldown={}s",
                        c.plugin,
                        c.enabled,
                        c.sensitivity,
                        c.window_size,
                        c.min_data_points,
                        c.check_patterns,
                        c.detect_spikes,
                        c.detect_trends,
                        c.notification_threshold,
                        c.cooldown_seconds,
                    ),
                    Err(e) => println!("{:<16} INVALID: {}", plugin, e),
                }
            }
        }
        Command::Test { plugin } => {
            let mut collectors = collector::create_collectors(&config);
            let samples = collector::collect_all(&mut collectors).await;
            let samples: Vec<_> = samples
                .into_iter()
                .filter(|s| plugin.as_deref().map_or(true, |p| s.plugin == p))
                .collect();
            if samples.is_empty() {
                anyhow::bail!("No samples collected{}", plugin.map(|p| format!(" for '{}'", p)).unwrap_or_default());
            }

            for sample in &samples {
                match pipeline.dry_run(sample).await {
                    Ok(Evaluation::InsufficientData { available, required }) => println!(
                        "{}/{} = {:.2}: warming up ({}/{} points)",
                        sample.plugin, sample.metric, sample.value, available, required
                    ),
                    Ok(Evaluation::Evaluated(r)) => println!(
                        "{}/{} = {:.2}: anomaly={} score={:.2} type={} trend={} confidence={} (mean {:.2}, std {:.2}, n={})",
                        r.plugin,
                        r.metric,
                        r.current_value,
                        r.is_anomaly,
                        r.anomaly_score,
                        r.tags_label(),
                        trend::label(
                            r.anomaly_type
                                .iter()
                                .copied()
                                .find(|t| matches!(t, AnomalyTag::TrendUp | AnomalyTag::TrendDown))
                        ),
                        r.confidence,
                        r.statistics.mean,
                        r.statistics.std_dev,
                        r.statistics.sample_count,
                    ),
                    Err(e) => println!("{}/{}: {}", sample.plugin, sample.metric, e),
                }
            }
        }
        Command::Summary { days, plugin } => {
            let today = Utc::now().date_naive();
            let summaries = stores.recorder.summarize(plugin.as_deref(), days, today).await?;
            println!("Detections over the last {} day(s):", days);
            for s in summaries {
                let tags = s
                    .tag_counts
                    .iter()
                    .map(|(tag, n)| format!("{}={}", tag, n))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!(
                    "{:<16} evaluations={} anomalies={} max|score|={} last={} {}",
                    s.plugin,
                    s.evaluations,
                    s.anomalies,
                    s.max_abs_score.map_or("-".to_string(), |v| format!("{:.2}", v)),
                    s.last_anomaly.map_or("-".to_string(), |t| t.to_rfc3339()),
                    tags,
                );
            }
        }
        Command::Set { plugin, key, value } => {
            let updated = stores.configs.set(&plugin, &key, &value).await?;
            info!(plugin = %plugin, key = %key, value = %value, "Plugin setting updated");
            println!("{}: {} = {}", updated.plugin, key, value);
        }
        Command::Init => {
            let created = stores.configs.create_defaults(&config.agent.plugins).await?;
            if created.is_empty() {
                println!("All plugins already configured.");
            } else {
                println!("Created default settings for: {}", created.join(", "));
            }
        }
        Command::Cleanup => {
            let removed = stores
                .recorder
                .cleanup(config.storage.retention_days, Utc::now().date_naive())
                .await?;
            println!("Removed {} result log(s) older than {} days.", removed, config.storage.retention_days);
        }
    }

    Ok(())
}

async fn run_once(config: &Config, pipeline: &Pipeline) -> CycleReport {
    let mut collectors = collector::create_collectors(config);
    let samples = collector::collect_all(&mut collectors).await;
    pipeline.run_cycle(samples, Utc::now()).await
}

async fn watch(config: &Config, pipeline: &Pipeline, interval_secs: u64) -> Result<()> {
    anyhow::ensure!(interval_secs > 0, "--interval must be at least 1 second");
    info!(interval_secs, hostname = %config.agent.hostname, "Starting watch mode");

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = run_once(config, pipeline).await;
                print_report(&report);
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Received shutdown signal, exiting");
                return Ok(());
            }
        }
    }
}

fn print_report(report: &CycleReport) {
    println!(
        "plugins={} evaluated={} warming_up={} disabled={} anomalies={} sent={} send_failures={}",
        report.plugins,
        report.processed,
        report.warming_up,
        report.disabled,
        report.anomalies,
        report.notifications_sent,
        report.notification_failures,
    );
    for failure in &report.failed_plugins {
        println!("  {} failed: {} ({} sample(s) skipped)", failure.plugin, failure.error, failure.skipped);
    }
}
