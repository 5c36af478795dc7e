// Metrics module - the collector contract and the metric data model
//
// Every source of samples (procfs readers, sysinfo snapshots, the Docker API)
// implements `Collector`. Collectors write `Sample`s into a `SampleSink`
// handed to them by the scrape engine; each sample points at an immutable
// `MetricDesc` created once when the collector was built.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod counter;
pub mod cpu;
pub mod disk;
pub mod docker;
pub mod load_average;
pub mod memory;
pub mod network;
pub mod registry;

pub use counter::MonotonicCounter;
pub use registry::{fq_name, NamespaceRegistry, RegistryError};

/// Errors raised while building descriptors or samples.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("invalid metric name: {0:?}")]
    InvalidName(String),

    #[error("invalid label name {label:?} on metric {metric}")]
    InvalidLabelName { metric: String, label: String },

    #[error("duplicate label name {label:?} on metric {metric}")]
    DuplicateLabel { metric: String, label: String },

    #[error("metric {metric} expects {expected} label value(s), got {got}")]
    LabelCardinality {
        metric: String,
        expected: usize,
        got: usize,
    },
}

/// Outcome of a collector update that did not succeed.
///
/// `NoData` is an expected empty state (feature disabled, nothing running,
/// not applicable on this host) and is not an operational error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectorError {
    #[error("collector returned no data")]
    NoData,

    #[error("{0}")]
    Failure(String),
}

impl CollectorError {
    pub fn failure(reason: impl fmt::Display) -> Self {
        CollectorError::Failure(reason.to_string())
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, CollectorError::NoData)
    }
}

impl From<MetricError> for CollectorError {
    fn from(err: MetricError) -> Self {
        CollectorError::Failure(err.to_string())
    }
}

/// Prometheus value type of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Gauge,
    Counter,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Gauge => write!(f, "gauge"),
            ValueKind::Counter => write!(f, "counter"),
        }
    }
}

/// Immutable identity of a metric family.
///
/// Created once per metric, usually in a collector's constructor, and shared
/// (through `Arc`) by every sample of that metric. Creating a descriptor per
/// sample breaks family grouping in the encoder.
#[derive(Debug, PartialEq)]
pub struct MetricDesc {
    name: String,
    help: String,
    label_names: Vec<String>,
    const_labels: Vec<(String, String)>,
}

impl MetricDesc {
    /// Creates a descriptor with variable labels only.
    ///
    /// # Errors
    /// Returns `MetricError` if the metric name or any label name is not a
    /// valid Prometheus identifier, or if a label name repeats.
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: &[&str],
    ) -> Result<Arc<Self>, MetricError> {
        Self::with_const_labels(name, help, label_names, &[])
    }

    /// Creates a descriptor that also carries constant label pairs, baked in
    /// at creation and emitted with every sample.
    pub fn with_const_labels(
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: &[&str],
        const_labels: &[(&str, &str)],
    ) -> Result<Arc<Self>, MetricError> {
        let name = name.into();
        if !is_valid_metric_name(&name) {
            return Err(MetricError::InvalidName(name));
        }

        let mut seen: Vec<&str> = Vec::with_capacity(label_names.len() + const_labels.len());
        for label in label_names
            .iter()
            .copied()
            .chain(const_labels.iter().map(|(k, _)| *k))
        {
            if !is_valid_label_name(label) {
                return Err(MetricError::InvalidLabelName {
                    metric: name,
                    label: label.to_string(),
                });
            }
            if seen.contains(&label) {
                return Err(MetricError::DuplicateLabel {
                    metric: name,
                    label: label.to_string(),
                });
            }
            seen.push(label);
        }

        Ok(Arc::new(MetricDesc {
            name,
            help: help.into(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
            const_labels: const_labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    pub fn const_labels(&self) -> &[(String, String)] {
        &self.const_labels
    }
}

/// One point-in-time observation of a metric.
///
/// Samples carry no timestamp; the gateway stamps them on arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    desc: Arc<MetricDesc>,
    kind: ValueKind,
    value: f64,
    label_values: Vec<String>,
}

impl Sample {
    /// Builds a sample, checking that exactly one value is supplied per
    /// label name of the descriptor.
    pub fn new<S: Into<String>>(
        desc: &Arc<MetricDesc>,
        kind: ValueKind,
        value: f64,
        label_values: impl IntoIterator<Item = S>,
    ) -> Result<Self, MetricError> {
        let label_values: Vec<String> = label_values.into_iter().map(Into::into).collect();
        if label_values.len() != desc.label_names.len() {
            return Err(MetricError::LabelCardinality {
                metric: desc.name.clone(),
                expected: desc.label_names.len(),
                got: label_values.len(),
            });
        }
        Ok(Sample {
            desc: Arc::clone(desc),
            kind,
            value,
            label_values,
        })
    }

    /// Shorthand for an unlabelled gauge.
    pub fn gauge(desc: &Arc<MetricDesc>, value: f64) -> Result<Self, MetricError> {
        Self::new(desc, ValueKind::Gauge, value, Vec::<String>::new())
    }

    pub fn desc(&self) -> &Arc<MetricDesc> {
        &self.desc
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn label_values(&self) -> &[String] {
        &self.label_values
    }
}

/// Multi-producer handle collectors write their samples into.
///
/// Clones share the same underlying channel. Each scrape worker gets a
/// child sink whose token the engine cancels when the collector overruns its
/// deadline; after that every `emit` on it is dropped.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: mpsc::UnboundedSender<Sample>,
    cancel: CancellationToken,
}

impl SampleSink {
    /// Creates a sink and the receiver that drains it.
    pub fn channel() -> (SampleSink, mpsc::UnboundedReceiver<Sample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = SampleSink {
            tx,
            cancel: CancellationToken::new(),
        };
        (sink, rx)
    }

    /// Sends a sample. Silently dropped once the sink is cancelled or the
    /// scrape that owns the receiver has already finished.
    pub fn emit(&self, sample: Sample) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.tx.send(sample);
    }

    /// Cancellation signal for long-running collectors.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the sink is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn child(&self) -> SampleSink {
        SampleSink {
            tx: self.tx.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Runs a blocking system read (procfs, statvfs, sysctl) on the blocking
/// pool so a stalled syscall cannot pin an async worker.
pub(crate) async fn read_blocking<T, F>(read: F) -> Result<T, CollectorError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(read)
        .await
        .map_err(|e| CollectorError::failure(format!("system read failed: {e}")))
}

/// Core trait that all metric collectors implement.
///
/// The scrape engine calls `update` from a dedicated task once per cycle and
/// never runs two updates of the same collector at once. A collector holding
/// state across cycles (previous counter readings, a primed CPU baseline)
/// must still guard it internally, since one instance may be shared by
/// several registries.
///
/// # Returns
/// * `Ok(())` - samples (possibly none) were written to the sink
/// * `Err(CollectorError::NoData)` - nothing to report this cycle
/// * `Err(CollectorError::Failure(_))` - the source could not be read
#[async_trait]
pub trait Collector: Send + Sync {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError>;
}

/// Registers every host collector under the registry's namespace.
///
/// Collectors named in `exclude` are skipped. Collectors that fail to
/// initialise are logged and skipped so one unavailable source does not keep
/// the module from starting.
///
/// # Adding New Collectors
/// 1. Create a new module (e.g., `entropy.rs`) implementing `Collector`
/// 2. Build its descriptors through `registry.desc(..)` in its constructor
/// 3. Add one `register_with` line here under a short, unique name
pub fn register_node_collectors(
    registry: &mut NamespaceRegistry,
    exclude: &[String],
) -> Result<(), RegistryError> {
    register_with(registry, exclude, "loadavg", load_average::LoadAverageCollector::new)?;
    register_with(registry, exclude, "meminfo", memory::MemoryCollector::new)?;
    register_with(registry, exclude, "filesystem", disk::DiskCollector::new)?;
    register_with(registry, exclude, "cpu", cpu::CpuCollector::new)?;
    register_with(registry, exclude, "netdev", network::NetworkCollector::new)?;
    Ok(())
}

/// Registers the container collectors for the `docker` module.
pub fn register_docker_collectors(
    registry: &mut NamespaceRegistry,
    exclude: &[String],
) -> Result<(), RegistryError> {
    register_with(registry, exclude, "containers", docker::DockerCollector::new)
}

fn register_with<C, F>(
    registry: &mut NamespaceRegistry,
    exclude: &[String],
    name: &str,
    build: F,
) -> Result<(), RegistryError>
where
    C: Collector + 'static,
    F: FnOnce(&mut NamespaceRegistry) -> Result<C, RegistryError>,
{
    if exclude.iter().any(|e| e == name) {
        return Ok(());
    }
    match build(registry) {
        Ok(collector) => registry.register(name, collector),
        Err(RegistryError::Init { reason, .. }) => {
            warn!(
                namespace = registry.namespace(),
                collector = name,
                error = %reason,
                "Collector unavailable, skipping"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    if name.starts_with("__") {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_rejects_bad_names() {
        assert_eq!(
            MetricDesc::new("1abc", "help", &[]).unwrap_err(),
            MetricError::InvalidName("1abc".to_string())
        );
        assert!(matches!(
            MetricDesc::new("ok", "help", &["__reserved"]),
            Err(MetricError::InvalidLabelName { .. })
        ));
        assert!(matches!(
            MetricDesc::new("ok", "help", &["bad-label"]),
            Err(MetricError::InvalidLabelName { .. })
        ));
        assert!(MetricDesc::new("node:ok_total", "help", &["device"]).is_ok());
    }

    #[test]
    fn test_desc_rejects_duplicate_labels() {
        let err = MetricDesc::with_const_labels("m", "h", &["a"], &[("a", "x")]).unwrap_err();
        assert_eq!(
            err,
            MetricError::DuplicateLabel {
                metric: "m".to_string(),
                label: "a".to_string()
            }
        );
    }

    #[test]
    fn test_sample_label_cardinality() {
        let desc = MetricDesc::new("m", "h", &["device", "mode"]).unwrap();
        assert!(Sample::new(&desc, ValueKind::Gauge, 1.0, ["eth0", "rx"]).is_ok());

        let err = Sample::new(&desc, ValueKind::Gauge, 1.0, ["eth0"]).unwrap_err();
        assert_eq!(
            err,
            MetricError::LabelCardinality {
                metric: "m".to_string(),
                expected: 2,
                got: 1
            }
        );
        assert!(matches!(
            CollectorError::from(err),
            CollectorError::Failure(_)
        ));
    }

    #[tokio::test]
    async fn test_sink_drops_after_cancel() {
        let (sink, mut rx) = SampleSink::channel();
        let desc = MetricDesc::new("m", "h", &[]).unwrap();

        let child = sink.child();
        child.emit(Sample::gauge(&desc, 1.0).unwrap());
        child.cancel();
        child.emit(Sample::gauge(&desc, 2.0).unwrap());
        assert!(child.is_cancelled());
        assert!(!sink.is_cancelled());
        sink.emit(Sample::gauge(&desc, 3.0).unwrap());
        drop((sink, child));

        let mut values = Vec::new();
        while let Some(sample) = rx.recv().await {
            values.push(sample.value());
        }
        assert_eq!(values, vec![1.0, 3.0]);
    }

    #[tokio::test]
    async fn test_read_blocking_reports_panics_as_failure() {
        assert_eq!(read_blocking(|| 7).await, Ok(7));

        let err = read_blocking(|| -> u64 { panic!("procfs vanished") }).await.unwrap_err();
        assert!(matches!(err, CollectorError::Failure(msg) if msg.starts_with("system read failed")));
    }
}
