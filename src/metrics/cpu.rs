// CPU usage metric collector
//
// CPU usage is a ratio between two readings, so this collector keeps a
// sysinfo `System` between cycles. The first cycle only primes the baseline.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::System;
use tracing::debug;

use super::{
    read_blocking, Collector, CollectorError, MetricDesc, NamespaceRegistry, RegistryError, Sample,
    SampleSink, ValueKind,
};

struct CpuState {
    system: System,
    primed: bool,
}

/// Per-core CPU usage collector
///
/// Exposes `<namespace>_cpu_usage_percent{cpu}` per logical core and
/// `<namespace>_cpu_cores`.
pub struct CpuCollector {
    usage: Arc<MetricDesc>,
    cores: Arc<MetricDesc>,
    state: Arc<Mutex<CpuState>>,
}

impl CpuCollector {
    pub fn new(registry: &mut NamespaceRegistry) -> Result<Self, RegistryError> {
        Ok(CpuCollector {
            usage: registry.desc(
                "cpu",
                "usage_percent",
                "CPU usage since the previous scrape, in percent.",
                &["cpu"],
            )?,
            cores: registry.desc("cpu", "cores", "Number of logical CPU cores.", &[])?,
            state: Arc::new(Mutex::new(CpuState {
                system: System::new(),
                primed: false,
            })),
        })
    }

    fn emit(&self, sink: &SampleSink, usage: &[(String, f32)]) -> Result<(), CollectorError> {
        for (cpu, percent) in usage {
            sink.emit(Sample::new(
                &self.usage,
                ValueKind::Gauge,
                f64::from(*percent),
                [cpu.as_str()],
            )?);
        }
        sink.emit(Sample::gauge(&self.cores, num_cpus::get() as f64)?);
        Ok(())
    }
}

#[async_trait]
impl Collector for CpuCollector {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError> {
        let state = Arc::clone(&self.state);
        let usage = read_blocking(move || {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.system.refresh_cpu();
            if !state.primed {
                state.primed = true;
                return None;
            }
            let usage: Vec<(String, f32)> = state
                .system
                .cpus()
                .iter()
                .map(|cpu| (cpu.name().to_string(), cpu.cpu_usage()))
                .collect();
            Some(usage)
        })
        .await?;

        let Some(usage) = usage else {
            debug!("CPU baseline primed");
            return Err(CollectorError::NoData);
        };
        if usage.is_empty() {
            return Err(CollectorError::NoData);
        }
        self.emit(sink, &usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_update_primes_baseline() {
        let mut registry = NamespaceRegistry::new("node");
        let collector = CpuCollector::new(&mut registry).unwrap();
        let (sink, mut rx) = SampleSink::channel();

        assert_eq!(collector.update(&sink).await, Err(CollectorError::NoData));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emits_per_core_usage() {
        let mut registry = NamespaceRegistry::new("node");
        let collector = CpuCollector::new(&mut registry).unwrap();
        let (sink, mut rx) = SampleSink::channel();

        let usage = vec![("cpu0".to_string(), 12.5), ("cpu1".to_string(), 50.0)];
        collector.emit(&sink, &usage).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.desc().name(), "node_cpu_usage_percent");
        assert_eq!(first.label_values(), ["cpu0".to_string()]);
        assert_eq!(first.value(), 12.5);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.value(), 50.0);
        let cores = rx.try_recv().unwrap();
        assert_eq!(cores.desc().name(), "node_cpu_cores");
    }
}
