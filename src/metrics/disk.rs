// Disk space metric collector
//
// Collects disk usage metrics for all mounted filesystems
// Provides information about total and available space

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use sysinfo::Disks;
use tracing::debug;

use super::{
    read_blocking, Collector, CollectorError, MetricDesc, NamespaceRegistry, RegistryError, Sample,
    SampleSink, ValueKind,
};

/// One mounted filesystem
#[derive(Debug, Clone)]
struct Mount {
    mount_point: String,
    filesystem: String,
    total: u64,
    available: u64,
}

/// Disk space metric collector
///
/// Each mounted filesystem is reported once, labelled by mount point and
/// filesystem type. Bind mounts that repeat a mount point are skipped.
///
/// # Platform Support
/// - Linux: Full support via statvfs
/// - macOS: Full support
/// - Windows: Full support (drive letters)
pub struct DiskCollector {
    size: Arc<MetricDesc>,
    avail: Arc<MetricDesc>,
}

impl DiskCollector {
    /// Creates a new DiskCollector instance
    pub fn new(registry: &mut NamespaceRegistry) -> Result<Self, RegistryError> {
        let labels = ["mountpoint", "fstype"];
        Ok(DiskCollector {
            size: registry.desc("filesystem", "size_bytes", "Filesystem size in bytes.", &labels)?,
            avail: registry.desc(
                "filesystem",
                "avail_bytes",
                "Filesystem space available to non-root users in bytes.",
                &labels,
            )?,
        })
    }

    fn emit(&self, sink: &SampleSink, mounts: &[Mount]) -> Result<(), CollectorError> {
        let mut seen = HashSet::new();
        for mount in mounts {
            if !seen.insert(mount.mount_point.as_str()) {
                continue;
            }
            let labels = [mount.mount_point.as_str(), mount.filesystem.as_str()];
            sink.emit(Sample::new(&self.size, ValueKind::Gauge, mount.total as f64, labels)?);
            sink.emit(Sample::new(&self.avail, ValueKind::Gauge, mount.available as f64, labels)?);
        }

        if seen.is_empty() {
            return Err(CollectorError::NoData);
        }
        Ok(())
    }
}

#[async_trait]
impl Collector for DiskCollector {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError> {
        // statvfs on a dead network mount can hang indefinitely
        let mounts = read_blocking(read_mounts).await?;
        debug!(count = mounts.len(), "Collected filesystem list");

        self.emit(sink, &mounts)
    }
}

/// Queries the OS for all mounted filesystems.
fn read_mounts() -> Vec<Mount> {
    Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|disk| Mount {
            mount_point: disk.mount_point().to_string_lossy().to_string(),
            filesystem: disk.file_system().to_string_lossy().to_string(),
            total: disk.total_space(),
            available: disk.available_space(),
        })
        .collect()
}
