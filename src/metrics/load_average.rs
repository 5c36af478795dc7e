// Load Average metric collector
//
// Collects system load average metrics (1min, 5min, 15min)
// These values indicate the average number of processes in the run queue
// or waiting for disk I/O over the specified time periods.

use async_trait::async_trait;
use std::sync::Arc;
use sysinfo::{LoadAvg, System};
use tracing::debug;

use super::{
    read_blocking, Collector, CollectorError, MetricDesc, NamespaceRegistry, RegistryError, Sample,
    SampleSink,
};

/// Load Average metric collector
///
/// Exposes `<namespace>_load1`, `<namespace>_load5` and `<namespace>_load15`.
///
/// # Platform Support
/// - Linux: Full support via /proc/loadavg
/// - macOS: Full support via sysctl
/// - Windows: Not available (reports no data)
pub struct LoadAverageCollector {
    load1: Arc<MetricDesc>,
    load5: Arc<MetricDesc>,
    load15: Arc<MetricDesc>,
}

impl LoadAverageCollector {
    /// Creates a new LoadAverageCollector, describing its metrics in `registry`
    pub fn new(registry: &mut NamespaceRegistry) -> Result<Self, RegistryError> {
        Ok(LoadAverageCollector {
            load1: registry.desc("", "load1", "1m load average.", &[])?,
            load5: registry.desc("", "load5", "5m load average.", &[])?,
            load15: registry.desc("", "load15", "15m load average.", &[])?,
        })
    }

    fn emit(&self, sink: &SampleSink, load: &LoadAvg) -> Result<(), CollectorError> {
        sink.emit(Sample::gauge(&self.load1, load.one)?);
        sink.emit(Sample::gauge(&self.load5, load.five)?);
        sink.emit(Sample::gauge(&self.load15, load.fifteen)?);
        Ok(())
    }
}

#[async_trait]
impl Collector for LoadAverageCollector {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError> {
        if cfg!(windows) {
            return Err(CollectorError::NoData);
        }

        let load = read_blocking(System::load_average).await?;
        debug!(
            "Load average: 1min={:.2}, 5min={:.2}, 15min={:.2}",
            load.one, load.five, load.fifteen
        );

        self.emit(sink, &load)
    }
}
