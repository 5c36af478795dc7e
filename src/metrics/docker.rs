// Docker stats metric collector
//
// Collects resource usage statistics for all running Docker containers
// Focuses on CPU and memory consumption per container
//
// A one-shot stats call blocks for about a second while the daemon takes a
// second CPU reading, so containers are queried concurrently.

use async_trait::async_trait;
use bollard::container::{Stats, StatsOptions};
use bollard::Docker;
use futures_util::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    Collector, CollectorError, MetricDesc, NamespaceRegistry, RegistryError, Sample, SampleSink,
    ValueKind,
};

/// Upper bound on stats requests in flight against the daemon
const STATS_CONCURRENCY: usize = 8;

/// A running container as listed by the daemon
#[derive(Debug, Clone)]
struct ContainerRef {
    id: String,
    name: String,
}

/// Resource usage of one container, derived from a Docker stats snapshot
#[derive(Debug, Clone, Default, PartialEq)]
struct ContainerUsage {
    name: String,
    id: String,
    cpu_percent: f64,
    memory_used: u64,
    memory_limit: u64,
    network_rx: u64,
    network_tx: u64,
    block_read: u64,
    block_write: u64,
}

impl ContainerUsage {
    fn from_stats(name: String, id: &str, stats: &Stats) -> Self {
        // Sum all network interfaces
        let (network_rx, network_tx) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks
                    .values()
                    .fold((0u64, 0u64), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes))
            })
            .unwrap_or((0, 0));

        let (block_read, block_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|io_stats| {
                io_stats.iter().fold((0u64, 0u64), |(read, write), stat| {
                    match stat.op.as_str() {
                        "read" | "Read" => (read + stat.value, write),
                        "write" | "Write" => (read, write + stat.value),
                        _ => (read, write),
                    }
                })
            })
            .unwrap_or((0, 0));

        ContainerUsage {
            name,
            // Short container id, as shown by `docker ps`
            id: id[..12.min(id.len())].to_string(),
            cpu_percent: calculate_cpu_percent(stats),
            memory_used: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            network_rx,
            network_tx,
            block_read,
            block_write,
        }
    }
}

/// Calculates CPU usage percentage from Docker stats
///
/// Docker provides cumulative CPU usage in nanoseconds.
/// We calculate the percentage based on system CPU stats.
///
/// # Formula
/// cpu_percent = (cpu_delta / system_cpu_delta) * num_cpus * 100.0
fn calculate_cpu_percent(stats: &Stats) -> f64 {
    let cpu_total = stats.cpu_stats.cpu_usage.total_usage as f64;
    let precpu_total = stats.precpu_stats.cpu_usage.total_usage as f64;

    let system_cpu = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    let presystem_cpu = stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;

    let cpu_delta = cpu_total - precpu_total;
    let system_delta = system_cpu - presystem_cpu;

    // Avoid division by zero
    if system_delta <= 0.0 || cpu_delta <= 0.0 {
        return 0.0;
    }

    let num_cpus = stats
        .cpu_stats
        .online_cpus
        .unwrap_or_else(|| num_cpus::get() as u64) as f64;

    (cpu_delta / system_delta) * num_cpus * 100.0
}

/// Docker container stats collector
///
/// For each running container, labelled `{name, id}`:
/// - CPU usage percentage
/// - Memory usage and limit
/// - Network I/O (bytes sent/received)
/// - Block I/O (bytes read/written)
///
/// # Requirements
/// - Docker daemon must be running
/// - User must have permissions to access Docker socket
/// - Default socket: unix:///var/run/docker.sock (Linux/macOS)
/// - Default socket: npipe:////./pipe/docker_engine (Windows)
pub struct DockerCollector {
    docker: Docker,
    cpu_percent: Arc<MetricDesc>,
    memory_usage: Arc<MetricDesc>,
    memory_limit: Arc<MetricDesc>,
    network_rx: Arc<MetricDesc>,
    network_tx: Arc<MetricDesc>,
    block_read: Arc<MetricDesc>,
    block_write: Arc<MetricDesc>,
}

impl DockerCollector {
    /// Creates a new DockerCollector instance
    ///
    /// Connects using the default socket and falls back to the environment
    /// (DOCKER_HOST, DOCKER_CERT_PATH, DOCKER_TLS_VERIFY).
    ///
    /// # Errors
    /// `RegistryError::Init` if no Docker client can be configured.
    pub fn new(registry: &mut NamespaceRegistry) -> Result<Self, RegistryError> {
        let docker = Docker::connect_with_socket_defaults()
            .or_else(|_| Docker::connect_with_local_defaults())
            .map_err(|e| RegistryError::Init {
                name: "containers".to_string(),
                reason: e.to_string(),
            })?;
        Self::with_client(registry, docker)
    }

    fn with_client(registry: &mut NamespaceRegistry, docker: Docker) -> Result<Self, RegistryError> {
        let labels = ["name", "id"];
        Ok(DockerCollector {
            docker,
            cpu_percent: registry.desc(
                "container",
                "cpu_percent",
                "Container CPU usage as a percentage of one core.",
                &labels,
            )?,
            memory_usage: registry.desc(
                "container",
                "memory_usage_bytes",
                "Container memory usage in bytes.",
                &labels,
            )?,
            memory_limit: registry.desc(
                "container",
                "memory_limit_bytes",
                "Container memory limit in bytes.",
                &labels,
            )?,
            network_rx: registry.desc(
                "container",
                "network_receive_bytes_total",
                "Bytes received by the container over all interfaces.",
                &labels,
            )?,
            network_tx: registry.desc(
                "container",
                "network_transmit_bytes_total",
                "Bytes transmitted by the container over all interfaces.",
                &labels,
            )?,
            block_read: registry.desc(
                "container",
                "block_read_bytes_total",
                "Bytes read by the container from block devices.",
                &labels,
            )?,
            block_write: registry.desc(
                "container",
                "block_write_bytes_total",
                "Bytes written by the container to block devices.",
                &labels,
            )?,
        })
    }

    fn emit(&self, sink: &SampleSink, usage: &ContainerUsage) -> Result<(), CollectorError> {
        let labels = [usage.name.as_str(), usage.id.as_str()];
        let gauges = [
            (&self.cpu_percent, usage.cpu_percent),
            (&self.memory_usage, usage.memory_used as f64),
            (&self.memory_limit, usage.memory_limit as f64),
        ];
        let counters = [
            (&self.network_rx, usage.network_rx),
            (&self.network_tx, usage.network_tx),
            (&self.block_read, usage.block_read),
            (&self.block_write, usage.block_write),
        ];
        for (desc, value) in gauges {
            sink.emit(Sample::new(desc, ValueKind::Gauge, value, labels)?);
        }
        for (desc, value) in counters {
            sink.emit(Sample::new(desc, ValueKind::Counter, value as f64, labels)?);
        }
        Ok(())
    }
}

#[async_trait]
impl Collector for DockerCollector {
    /// Collects current Docker container statistics
    ///
    /// # Errors
    /// - `NoData` when no container is running
    /// - `Failure` if the daemon cannot be reached or listing fails
    ///
    /// A container whose stats cannot be read is skipped; the others are
    /// still reported.
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError> {
        debug!("Collecting Docker container statistics");

        let containers = self
            .docker
            .list_containers::<String>(None)
            .await
            .map_err(|e| CollectorError::failure(format!("failed to list containers: {e}")))?;

        if containers.is_empty() {
            return Err(CollectorError::NoData);
        }
        debug!("Found {} running container(s)", containers.len());

        let containers: Vec<ContainerRef> = containers
            .into_iter()
            .map(|container| ContainerRef {
                id: container.id.unwrap_or_default(),
                name: container
                    .names
                    .and_then(|names| names.first().map(|n| n.trim_start_matches('/').to_string()))
                    .unwrap_or_else(|| "unknown".to_string()),
            })
            .collect();

        let reported = self
            .gather_usage(sink, containers, |container| self.fetch_usage(container))
            .await?;
        debug!(reported, "Container statistics collected");
        Ok(())
    }
}

impl DockerCollector {
    /// Fetches usage for every container with at most `STATS_CONCURRENCY`
    /// requests in flight, emitting each container as soon as it arrives.
    ///
    /// Stops early once the sink is cancelled. Returns the number of
    /// containers reported.
    async fn gather_usage<F, Fut>(
        &self,
        sink: &SampleSink,
        containers: Vec<ContainerRef>,
        fetch: F,
    ) -> Result<usize, CollectorError>
    where
        F: FnMut(ContainerRef) -> Fut,
        Fut: Future<Output = Option<ContainerUsage>>,
    {
        let mut usages = stream::iter(containers)
            .map(fetch)
            .buffer_unordered(STATS_CONCURRENCY);

        let mut reported = 0;
        while let Some(usage) = usages.next().await {
            if sink.is_cancelled() {
                break;
            }
            if let Some(usage) = usage {
                self.emit(sink, &usage)?;
                reported += 1;
            }
        }
        Ok(reported)
    }

    /// One-shot stats for a single container; `None` if the daemon had none.
    async fn fetch_usage(&self, container: ContainerRef) -> Option<ContainerUsage> {
        let stats_options = StatsOptions {
            stream: false,
            ..Default::default()
        };
        let mut stats_stream = self.docker.stats(&container.id, Some(stats_options));

        match stats_stream.next().await {
            Some(Ok(stats)) => {
                let usage = ContainerUsage::from_stats(container.name, &container.id, &stats);
                debug!(
                    "Container {}: CPU={:.1}%, Mem={}/{} bytes",
                    usage.name, usage.cpu_percent, usage.memory_used, usage.memory_limit
                );
                Some(usage)
            }
            Some(Err(e)) => {
                warn!(container = %container.name, error = %e, "Failed to get container stats");
                None
            }
            None => {
                debug!(container = %container.name, "Container stats stream ended without data");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emits_gauges_and_counters() {
        let mut registry = NamespaceRegistry::new("docker");
        let docker = Docker::connect_with_http("http://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
            .unwrap();
        let collector = DockerCollector::with_client(&mut registry, docker).unwrap();
        let (sink, mut rx) = SampleSink::channel();

        let usage = ContainerUsage {
            name: "web".to_string(),
            id: "0123456789ab".to_string(),
            cpu_percent: 25.5,
            memory_used: 512,
            memory_limit: 2048,
            network_rx: 10,
            network_tx: 20,
            block_read: 30,
            block_write: 40,
        };
        collector.emit(&sink, &usage).unwrap();

        let samples: Vec<Sample> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(samples.len(), 7);
        assert_eq!(samples[0].desc().name(), "docker_container_cpu_percent");
        assert_eq!(samples[0].label_values(), ["web".to_string(), "0123456789ab".to_string()]);
        assert_eq!(samples[0].kind(), ValueKind::Gauge);
        assert_eq!(samples[3].desc().name(), "docker_container_network_receive_bytes_total");
        assert_eq!(samples[3].kind(), ValueKind::Counter);
        assert_eq!(samples[6].value(), 40.0);
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_failure() {
        let mut registry = NamespaceRegistry::new("docker");
        let docker = Docker::connect_with_http("http://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
            .unwrap();
        let collector = DockerCollector::with_client(&mut registry, docker).unwrap();
        let (sink, _rx) = SampleSink::channel();

        let err = collector.update(&sink).await.unwrap_err();
        assert!(matches!(err, CollectorError::Failure(_)));
    }

    #[tokio::test]
    async fn test_containers_are_queried_concurrently() {
        let mut registry = NamespaceRegistry::new("docker");
        let docker = Docker::connect_with_http("http://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
            .unwrap();
        let collector = DockerCollector::with_client(&mut registry, docker).unwrap();
        let (sink, mut rx) = SampleSink::channel();

        let containers: Vec<ContainerRef> = (0..6)
            .map(|i| ContainerRef {
                id: format!("{i:012}"),
                name: format!("app{i}"),
            })
            .collect();

        let begin = std::time::Instant::now();
        let reported = collector
            .gather_usage(&sink, containers, |container| async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                // a container that exited between list and stats
                if container.name == "app3" {
                    return None;
                }
                Some(ContainerUsage {
                    name: container.name,
                    id: container.id,
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        let elapsed = begin.elapsed();

        assert_eq!(reported, 5);
        assert!(elapsed < std::time::Duration::from_millis(600), "took {elapsed:?}");

        let samples: Vec<Sample> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(samples.len(), 5 * 7);
        let mut names: Vec<&str> = samples
            .iter()
            .filter(|s| s.desc().name() == "docker_container_cpu_percent")
            .map(|s| s.label_values()[0].as_str())
            .collect();
        names.sort();
        assert_eq!(names, vec!["app0", "app1", "app2", "app4", "app5"]);
    }
}
