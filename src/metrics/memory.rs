// Memory metric collector
//
// Collects system memory usage metrics including RAM and swap.
// All values are reported in bytes.

use async_trait::async_trait;
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

use super::{
    read_blocking, Collector, CollectorError, MetricDesc, NamespaceRegistry, RegistryError, Sample,
    SampleSink,
};

/// Raw memory readings, in bytes
#[derive(Debug, Clone, Copy, Default)]
struct MemoryReading {
    total: u64,
    available: u64,
    used: u64,
    free: u64,
    swap_total: u64,
    swap_used: u64,
}

impl MemoryReading {
    // A fresh System each time gives fresh readings without shared state
    fn read() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        MemoryReading {
            total: sys.total_memory(),
            available: sys.available_memory(),
            used: sys.used_memory(),
            free: sys.free_memory(),
            swap_total: sys.total_swap(),
            swap_used: sys.used_swap(),
        }
    }
}

/// Memory usage metric collector
///
/// # Platform Support
/// - Linux: Full support via /proc/meminfo
/// - macOS: Full support via vm_stat
/// - Windows: Full support via GlobalMemoryStatusEx
pub struct MemoryCollector {
    total: Arc<MetricDesc>,
    available: Arc<MetricDesc>,
    used: Arc<MetricDesc>,
    free: Arc<MetricDesc>,
    swap_total: Arc<MetricDesc>,
    swap_used: Arc<MetricDesc>,
}

impl MemoryCollector {
    /// Creates a new MemoryCollector instance
    pub fn new(registry: &mut NamespaceRegistry) -> Result<Self, RegistryError> {
        Ok(MemoryCollector {
            total: registry.desc("memory", "total_bytes", "Total physical memory in bytes.", &[])?,
            available: registry.desc(
                "memory",
                "available_bytes",
                "Memory available for new allocations, including reclaimable cache, in bytes.",
                &[],
            )?,
            used: registry.desc("memory", "used_bytes", "Memory in use in bytes.", &[])?,
            free: registry.desc("memory", "free_bytes", "Completely unused memory in bytes.", &[])?,
            swap_total: registry.desc("memory", "swap_total_bytes", "Total swap space in bytes.", &[])?,
            swap_used: registry.desc("memory", "swap_used_bytes", "Swap space in use in bytes.", &[])?,
        })
    }

    fn emit(&self, sink: &SampleSink, reading: MemoryReading) -> Result<(), CollectorError> {
        // A zero total means the platform gave us nothing useful.
        if reading.total == 0 {
            return Err(CollectorError::NoData);
        }
        sink.emit(Sample::gauge(&self.total, reading.total as f64)?);
        sink.emit(Sample::gauge(&self.available, reading.available as f64)?);
        sink.emit(Sample::gauge(&self.used, reading.used as f64)?);
        sink.emit(Sample::gauge(&self.free, reading.free as f64)?);
        sink.emit(Sample::gauge(&self.swap_total, reading.swap_total as f64)?);
        sink.emit(Sample::gauge(&self.swap_used, reading.swap_used as f64)?);
        Ok(())
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError> {
        let reading = read_blocking(MemoryReading::read).await?;
        debug!(
            used = reading.used,
            total = reading.total,
            swap_used = reading.swap_used,
            "Memory reading"
        );

        self.emit(sink, reading)
    }
}
