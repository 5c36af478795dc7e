// Network interface metric collector
//
// Interface byte counters reported by the OS reset when an interface is
// recreated, so each device's totals are kept in a MonotonicCounter.
// Devices that disappear (veth pairs of stopped containers) are forgotten.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::Networks;
use tracing::debug;

use super::{
    read_blocking, Collector, CollectorError, MetricDesc, MonotonicCounter, NamespaceRegistry,
    RegistryError, Sample, SampleSink, ValueKind,
};

#[derive(Default)]
struct DeviceCounters {
    receive: MonotonicCounter,
    transmit: MonotonicCounter,
}

/// Network traffic collector
///
/// Exposes `<namespace>_network_receive_bytes_total{device}` and
/// `<namespace>_network_transmit_bytes_total{device}`.
pub struct NetworkCollector {
    receive: Arc<MetricDesc>,
    transmit: Arc<MetricDesc>,
    networks: Arc<Mutex<Networks>>,
    devices: Mutex<HashMap<String, DeviceCounters>>,
}

impl NetworkCollector {
    pub fn new(registry: &mut NamespaceRegistry) -> Result<Self, RegistryError> {
        Ok(NetworkCollector {
            receive: registry.desc(
                "network",
                "receive_bytes_total",
                "Network device statistic receive_bytes.",
                &["device"],
            )?,
            transmit: registry.desc(
                "network",
                "transmit_bytes_total",
                "Network device statistic transmit_bytes.",
                &["device"],
            )?,
            networks: Arc::new(Mutex::new(Networks::new())),
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// Folds raw `(device, rx, tx)` totals into the per-device counters and
    /// emits the accumulated values. Counters of devices missing from
    /// `readings` are dropped.
    fn emit(
        &self,
        sink: &SampleSink,
        devices: &mut HashMap<String, DeviceCounters>,
        readings: &[(String, u64, u64)],
    ) -> Result<(), CollectorError> {
        devices.retain(|name, _| readings.iter().any(|(device, _, _)| device == name));
        if readings.is_empty() {
            return Err(CollectorError::NoData);
        }
        for (device, rx, tx) in readings {
            let counters = devices.entry(device.clone()).or_default();
            let rx_total = counters.receive.observe(*rx as f64);
            let tx_total = counters.transmit.observe(*tx as f64);
            sink.emit(Sample::new(&self.receive, ValueKind::Counter, rx_total, [device.as_str()])?);
            sink.emit(Sample::new(&self.transmit, ValueKind::Counter, tx_total, [device.as_str()])?);
        }
        Ok(())
    }
}

#[async_trait]
impl Collector for NetworkCollector {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError> {
        let networks = Arc::clone(&self.networks);
        let readings: Vec<(String, u64, u64)> = read_blocking(move || {
            let mut networks = networks.lock().unwrap_or_else(PoisonError::into_inner);
            networks.refresh_list();
            networks.refresh();
            networks
                .list()
                .iter()
                .map(|(name, data)| (name.clone(), data.total_received(), data.total_transmitted()))
                .collect()
        })
        .await?;
        debug!(devices = readings.len(), "Collected network devices");

        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        self.emit(sink, &mut devices, &readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_survive_interface_reset() {
        let mut registry = NamespaceRegistry::new("node");
        let collector = NetworkCollector::new(&mut registry).unwrap();
        let mut devices = HashMap::new();
        let (sink, mut rx) = SampleSink::channel();

        collector
            .emit(&sink, &mut devices, &[("eth0".to_string(), 1000, 500)])
            .unwrap();
        // eth0 was recreated and its counters started over
        collector
            .emit(&sink, &mut devices, &[("eth0".to_string(), 100, 50)])
            .unwrap();

        let samples: Vec<Sample> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[2].desc().name(), "node_network_receive_bytes_total");
        assert_eq!(samples[2].kind(), ValueKind::Counter);
        assert_eq!(samples[2].value(), 1100.0);
        assert_eq!(samples[3].value(), 550.0);
    }

    #[test]
    fn test_no_devices_is_no_data() {
        let mut registry = NamespaceRegistry::new("node");
        let collector = NetworkCollector::new(&mut registry).unwrap();
        let (sink, _rx) = SampleSink::channel();

        let result = collector.emit(&sink, &mut HashMap::new(), &[]);
        assert_eq!(result, Err(CollectorError::NoData));
    }

    #[test]
    fn test_vanished_devices_are_forgotten() {
        let mut registry = NamespaceRegistry::new("node");
        let collector = NetworkCollector::new(&mut registry).unwrap();
        let mut devices = HashMap::new();
        let (sink, _rx) = SampleSink::channel();

        let both = [("eth0".to_string(), 10, 10), ("veth1a2b".to_string(), 5, 5)];
        collector.emit(&sink, &mut devices, &both).unwrap();
        assert_eq!(devices.len(), 2);

        collector
            .emit(&sink, &mut devices, &[("eth0".to_string(), 20, 20)])
            .unwrap();
        assert_eq!(devices.keys().collect::<Vec<_>>(), vec!["eth0"]);

        assert_eq!(collector.emit(&sink, &mut devices, &[]), Err(CollectorError::NoData));
        assert!(devices.is_empty());
    }
}
