pub mod cpu;
pub mod disk;
pub mod fd;
pub mod load;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::types::PluginSample;

/// Trait for all metric collectors.
///
/// Each collector reads one category of system metrics from procfs or a
/// system tool and returns them as `PluginSample` values. A collector emits at
/// most one sample per plugin name per call.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Human-readable name for this collector (e.g., "cpu", "memory")
    fn name(&self) -> &str;

    /// Take one reading. Called once per cycle.
    async fn collect(&mut self) -> Result<Vec<PluginSample>>;
}

/// Create all enabled collectors based on configuration
pub fn create_collectors(config: &Config) -> Vec<Box<dyn Collector>> {
    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();

    if config.collector.cpu.enabled {
        collectors.push(Box::new(cpu::CpuCollector::new(&config.collector.cpu)));
    }

    if config.collector.memory.enabled {
        collectors.push(Box::new(memory::MemoryCollector));
    }

    if config.collector.load.enabled {
        collectors.push(Box::new(load::LoadCollector));
    }

    if config.collector.disk.enabled {
        collectors.push(Box::new(disk::DiskCollector::new(&config.collector.disk)));
    }

    if config.collector.fd.enabled {
        collectors.push(Box::new(fd::FdCollector));
    }

    tracing::info!(count = collectors.len(), "Initialized collectors");
    collectors
}

/// Run every collector once. A failing collector is logged and skipped.
pub async fn collect_all(collectors: &mut [Box<dyn Collector>]) -> Vec<PluginSample> {
    let mut samples = Vec::new();
    for collector in collectors.iter_mut() {
        match collector.collect().await {
            Ok(mut batch) => {
                tracing::debug!(collector = collector.name(), samples = batch.len(), "Collected");
                samples.append(&mut batch);
            }
            Err(e) => {
                tracing::warn!(collector = collector.name(), error = %e, "Collector failed");
            }
        }
    }
    samples
}

/// Percentage of `part` in `whole`; `None` when `whole` is zero.
pub(crate) fn percent(part: f64, whole: f64) -> Option<f64> {
    if whole > 0.0 {
        Some(100.0 * part / whole)
    } else {
        None
    }
}
