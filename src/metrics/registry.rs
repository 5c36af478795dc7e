// Namespace registry - the collectors of one module
//
// A registry is created empty when a module is built, populated by the
// collector constructors it is passed into, and then moved into the scrape
// engine, after which it is read-only.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use super::{Collector, MetricDesc, MetricError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("collector {name:?} already registered in namespace {namespace:?}")]
    DuplicateCollector { namespace: String, name: String },

    #[error("metric {0:?} already described in this namespace")]
    DuplicateMetric(String),

    #[error("invalid metric descriptor: {0}")]
    Metric(#[from] MetricError),

    #[error("collector {name:?} failed to initialise: {reason}")]
    Init { name: String, reason: String },
}

/// Joins the non-empty parts of a metric name with underscores.
///
/// # Example
/// ```
/// use metrics_pusher::metrics::fq_name;
/// assert_eq!(fq_name("node", "scrape", "collector_success"), "node_scrape_collector_success");
/// assert_eq!(fq_name("node", "", "load1"), "node_load1");
/// ```
pub fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Named collectors of one namespace (e.g. "node", "docker").
///
/// Enumeration order is the lexical order of collector names, so it is
/// stable across cycles. There is no removal; registries are append-only.
pub struct NamespaceRegistry {
    namespace: String,
    collectors: BTreeMap<String, Arc<dyn Collector>>,
    metric_names: HashSet<String>,
}

impl NamespaceRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        NamespaceRegistry {
            namespace: namespace.into(),
            collectors: BTreeMap::new(),
            metric_names: HashSet::new(),
        }
    }

    /// The namespace, also used as metric-name prefix and push job name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Adds a collector under `name`.
    ///
    /// # Errors
    /// `RegistryError::DuplicateCollector` if the name is already taken in
    /// this namespace.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        collector: impl Collector + 'static,
    ) -> Result<(), RegistryError> {
        self.register_shared(name, Arc::new(collector))
    }

    /// Adds a collector instance that may also be registered elsewhere.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        collector: Arc<dyn Collector>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.collectors.contains_key(&name) {
            return Err(RegistryError::DuplicateCollector {
                namespace: self.namespace.clone(),
                name,
            });
        }
        self.collectors.insert(name, collector);
        Ok(())
    }

    /// Creates a descriptor named `<namespace>_<subsystem>_<name>`.
    ///
    /// Each fully-qualified name may only be described once per registry.
    pub fn desc(
        &mut self,
        subsystem: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<Arc<MetricDesc>, RegistryError> {
        let fq = fq_name(&self.namespace, subsystem, name);
        if self.metric_names.contains(&fq) {
            return Err(RegistryError::DuplicateMetric(fq));
        }
        let desc = MetricDesc::new(fq.clone(), help, label_names)?;
        self.metric_names.insert(fq);
        Ok(desc)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Collector>)> {
        self.collectors.iter().map(|(name, c)| (name.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}
