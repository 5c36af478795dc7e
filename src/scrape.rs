// Scrape engine - fans out to every registered collector of a namespace
//
// # Architecture
// - One Tokio task per collector per scrape
// - A collector's update runs on its own inner task, so a panic or an
//   overrun deadline is contained to that collector
// - A task that overruns its deadline is left to finish in the background
//   with its sink cancelled; until it does, its collector is skipped, so no
//   collector ever has two updates running
// - The engine waits on every worker before handing back a snapshot
// - Each worker adds `<ns>_scrape_collector_duration_seconds` and
//   `<ns>_scrape_collector_success` after its collector returns

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error};

use crate::metrics::{
    Collector, CollectorError, MetricDesc, NamespaceRegistry, RegistryError, Sample, SampleSink,
    ValueKind,
};

/// Result of one collector in one scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOutcome {
    pub collector: String,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<CollectorError>,
}

/// Everything gathered in one scrape: collector samples plus accounting
/// samples, and the per-collector outcomes they were derived from.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub samples: Vec<Sample>,
    pub outcomes: Vec<ScrapeOutcome>,
}

impl Snapshot {
    pub fn failed_collectors(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}

/// Concurrent, fault-isolated collector runner for one namespace.
///
/// Owns the registry it was built from; once the engine exists the set of
/// collectors is fixed.
pub struct ScrapeEngine {
    registry: NamespaceRegistry,
    duration_desc: Arc<MetricDesc>,
    success_desc: Arc<MetricDesc>,
    collector_timeout: Duration,
    /// Updates that overran their deadline and have not returned yet
    stragglers: Mutex<HashMap<String, UpdateTask>>,
}

type UpdateTask = JoinHandle<Result<(), CollectorError>>;

impl ScrapeEngine {
    /// Freezes `registry` into an engine.
    ///
    /// # Arguments
    /// * `registry` - collectors to run each scrape
    /// * `collector_timeout` - deadline for a single collector's update
    pub fn new(
        mut registry: NamespaceRegistry,
        collector_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let namespace = registry.namespace().to_string();
        let duration_desc = registry.desc(
            "scrape",
            "collector_duration_seconds",
            &format!("{namespace}_exporter: Duration of a collector scrape."),
            &["collector"],
        )?;
        let success_desc = registry.desc(
            "scrape",
            "collector_success",
            &format!("{namespace}_exporter: Whether a collector succeeded."),
            &["collector"],
        )?;

        Ok(ScrapeEngine {
            registry,
            duration_desc,
            success_desc,
            collector_timeout,
            stragglers: Mutex::new(HashMap::new()),
        })
    }

    pub fn namespace(&self) -> &str {
        self.registry.namespace()
    }

    pub fn collector_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs every collector concurrently and returns once all have finished.
    ///
    /// Total latency is bounded by the slowest collector (or the collector
    /// deadline), not by the sum of all of them.
    pub async fn gather(&self) -> Snapshot {
        let (sink, mut rx) = SampleSink::channel();
        let mut workers = JoinSet::new();
        let mut outcomes = Vec::with_capacity(self.registry.len());

        {
            let mut stragglers = self.stragglers.lock().unwrap_or_else(PoisonError::into_inner);
            stragglers.retain(|_, task| !task.is_finished());

            for (name, collector) in self.registry.iter() {
                let worker = Worker {
                    name: name.to_string(),
                    collector: Arc::clone(collector),
                    sink: sink.child(),
                    accounting: sink.clone(),
                    duration_desc: Arc::clone(&self.duration_desc),
                    success_desc: Arc::clone(&self.success_desc),
                    deadline: self.collector_timeout,
                };
                if stragglers.contains_key(name) {
                    outcomes.push(worker.skip());
                } else {
                    workers.spawn(worker.run());
                }
            }
        }
        drop(sink);

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((outcome, straggler)) => {
                    if let Some(task) = straggler {
                        self.stragglers
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(outcome.collector.clone(), task);
                    }
                    outcomes.push(outcome);
                }
                // Workers catch collector panics themselves; this only
                // happens if the runtime is shutting down underneath us.
                Err(e) => error!(namespace = self.namespace(), error = %e, "Scrape worker lost"),
            }
        }
        outcomes.sort_by(|a, b| a.collector.cmp(&b.collector));

        // Every worker is done, so the buffer is final. Whatever an overrunning
        // collector tried to emit after its deadline was dropped by its sink.
        let mut samples = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            samples.push(sample);
        }

        Snapshot { samples, outcomes }
    }
}

struct Worker {
    name: String,
    collector: Arc<dyn Collector>,
    sink: SampleSink,
    accounting: SampleSink,
    duration_desc: Arc<MetricDesc>,
    success_desc: Arc<MetricDesc>,
    deadline: Duration,
}

impl Worker {
    /// Runs the collector's update under the deadline. Returns the update
    /// task as well when it overran, since it is still running.
    async fn run(self) -> (ScrapeOutcome, Option<UpdateTask>) {
        let begin = Instant::now();

        let mut task = {
            let collector = Arc::clone(&self.collector);
            let sink = self.sink.clone();
            tokio::spawn(async move { collector.update(&sink).await })
        };

        // An overrunning task is not aborted; it is signalled through its sink.
        let (result, straggler) = match timeout(self.deadline, &mut task).await {
            Ok(Ok(result)) => (result, None),
            Ok(Err(join_err)) => (
                Err(CollectorError::failure(format!("collector task failed: {join_err}"))),
                None,
            ),
            Err(_) => {
                self.sink.cancel();
                let err = CollectorError::failure(format!(
                    "timed out after {:.3}s",
                    self.deadline.as_secs_f64()
                ));
                (Err(err), Some(task))
            }
        };
        let duration = begin.elapsed();

        (self.finish(duration, result), straggler)
    }

    /// Reports a collector whose previous update has not returned yet.
    fn skip(self) -> ScrapeOutcome {
        let result = Err(CollectorError::failure("previous update still running"));
        self.finish(Duration::ZERO, result)
    }

    fn finish(self, duration: Duration, result: Result<(), CollectorError>) -> ScrapeOutcome {
        match &result {
            Ok(()) => {}
            Err(CollectorError::NoData) => debug!(
                collector = %self.name,
                duration_seconds = duration.as_secs_f64(),
                "Collector returned no data"
            ),
            Err(e) => error!(
                collector = %self.name,
                duration_seconds = duration.as_secs_f64(),
                error = %e,
                "Collector failed"
            ),
        }

        let success = result.is_ok();
        self.emit_accounting(duration, success);

        ScrapeOutcome {
            collector: self.name,
            duration,
            success,
            error: result.err(),
        }
    }

    fn emit_accounting(&self, duration: Duration, success: bool) {
        let labels = [self.name.as_str()];
        let samples = [
            Sample::new(&self.duration_desc, ValueKind::Gauge, duration.as_secs_f64(), labels),
            Sample::new(
                &self.success_desc,
                ValueKind::Gauge,
                if success { 1.0 } else { 0.0 },
                labels,
            ),
        ];
        for sample in samples {
            match sample {
                Ok(sample) => self.accounting.emit(sample),
                // Both descriptors carry exactly one label.
                Err(e) => error!(collector = %self.name, error = %e, "Bad accounting sample"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test collector with a scripted result and optional delay
    enum Script {
        Value(f64),
        NoData,
        Fail,
        Sleep(Duration),
        Hang,
        Panic,
    }

    struct Fake {
        desc: Arc<MetricDesc>,
        script: Script,
    }

    impl Fake {
        fn new(registry: &mut NamespaceRegistry, name: &str, script: Script) -> Self {
            Fake {
                desc: registry.desc("", name, "test metric", &[]).unwrap(),
                script,
            }
        }
    }

    #[async_trait]
    impl Collector for Fake {
        async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError> {
            match &self.script {
                Script::Value(v) => {
                    sink.emit(Sample::gauge(&self.desc, *v)?);
                    Ok(())
                }
                Script::NoData => Err(CollectorError::NoData),
                Script::Fail => Err(CollectorError::failure("boom")),
                Script::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    sink.emit(Sample::gauge(&self.desc, 1.0)?);
                    Ok(())
                }
                Script::Hang => {
                    sink.emit(Sample::gauge(&self.desc, 1.0)?);
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Script::Panic => panic!("collector bug"),
            }
        }
    }

    fn engine(collectors: Vec<(&str, Script)>, deadline: Duration) -> ScrapeEngine {
        let mut registry = NamespaceRegistry::new("node");
        for (name, script) in collectors {
            let fake = Fake::new(&mut registry, name, script);
            registry.register(name, fake).unwrap();
        }
        ScrapeEngine::new(registry, deadline).unwrap()
    }

    fn accounting(snapshot: &Snapshot, metric: &str, collector: &str) -> Option<f64> {
        snapshot
            .samples
            .iter()
            .find(|s| s.desc().name() == metric && s.label_values() == [collector.to_string()])
            .map(|s| s.value())
    }

    #[tokio::test]
    async fn test_success_and_no_data_accounting() {
        let engine = engine(
            vec![("cpu", Script::Value(0.42)), ("disk", Script::NoData)],
            Duration::from_secs(5),
        );
        let snapshot = engine.gather().await;

        assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "cpu"), Some(1.0));
        assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "disk"), Some(0.0));
        let duration = accounting(&snapshot, "node_scrape_collector_duration_seconds", "cpu").unwrap();
        assert!(duration >= 0.0);

        let cpu = snapshot.samples.iter().find(|s| s.desc().name() == "node_cpu").unwrap();
        assert_eq!(cpu.value(), 0.42);
        assert_eq!(cpu.kind(), ValueKind::Gauge);

        assert_eq!(snapshot.outcomes.len(), 2);
        assert_eq!(snapshot.outcomes[1].error, Some(CollectorError::NoData));
        assert_eq!(snapshot.failed_collectors(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let engine = engine(
            vec![("a", Script::Value(7.0)), ("b", Script::Fail), ("c", Script::Panic)],
            Duration::from_secs(5),
        );
        let snapshot = engine.gather().await;

        assert!(snapshot.samples.iter().any(|s| s.desc().name() == "node_a" && s.value() == 7.0));
        assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "a"), Some(1.0));
        assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "b"), Some(0.0));
        assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "c"), Some(0.0));
        assert!(matches!(snapshot.outcomes[2].error, Some(CollectorError::Failure(_))));
    }

    #[tokio::test]
    async fn test_latency_is_bounded_by_slowest_collector() {
        let delay = Duration::from_millis(200);
        let engine = engine(
            vec![
                ("a", Script::Sleep(delay)),
                ("b", Script::Sleep(delay)),
                ("c", Script::Sleep(delay)),
                ("d", Script::Sleep(delay)),
            ],
            Duration::from_secs(5),
        );

        let begin = Instant::now();
        let snapshot = engine.gather().await;
        let elapsed = begin.elapsed();

        assert!(elapsed >= delay);
        assert!(elapsed < delay * 3, "scrape took {elapsed:?}");
        // barrier: every collector's sample and accounting is present
        assert_eq!(snapshot.samples.len(), 4 * 3);
        assert!(snapshot.outcomes.iter().all(|o| o.success));
    }

    #[tokio::test]
    async fn test_hung_collector_hits_deadline() {
        let engine = engine(
            vec![("ok", Script::Value(1.0)), ("stuck", Script::Hang)],
            Duration::from_millis(100),
        );

        let begin = Instant::now();
        let snapshot = engine.gather().await;
        assert!(begin.elapsed() < Duration::from_secs(2));

        assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "ok"), Some(1.0));
        assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "stuck"), Some(0.0));
        let stuck = snapshot.outcomes.iter().find(|o| o.collector == "stuck").unwrap();
        assert!(matches!(&stuck.error, Some(CollectorError::Failure(msg)) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_empty_registry_gathers_nothing() {
        let engine = engine(vec![], Duration::from_secs(1));
        let snapshot = engine.gather().await;
        assert!(snapshot.samples.is_empty());
        assert!(snapshot.outcomes.is_empty());
    }

    /// Blocks its thread like a hung statvfs and records overlapping calls
    struct Blocking {
        block: Duration,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Collector for Blocking {
        async fn update(&self, _sink: &SampleSink) -> Result<(), CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.block);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overrunning_update_is_never_run_twice() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = NamespaceRegistry::new("node");
        let ok = Fake::new(&mut registry, "ok", Script::Value(1.0));
        registry.register("ok", ok).unwrap();
        registry
            .register(
                "stuck",
                Blocking {
                    block: Duration::from_millis(600),
                    active: Arc::clone(&active),
                    max_active: Arc::clone(&max_active),
                    calls: Arc::clone(&calls),
                },
            )
            .unwrap();
        let engine = ScrapeEngine::new(registry, Duration::from_millis(100)).unwrap();

        let first = engine.gather().await;
        let stuck = first.outcomes.iter().find(|o| o.collector == "stuck").unwrap();
        assert!(matches!(&stuck.error, Some(CollectorError::Failure(msg)) if msg.contains("timed out")));

        for _ in 0..2 {
            let snapshot = engine.gather().await;
            assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "ok"), Some(1.0));
            assert_eq!(accounting(&snapshot, "node_scrape_collector_success", "stuck"), Some(0.0));
            let stuck = snapshot.outcomes.iter().find(|o| o.collector == "stuck").unwrap();
            assert_eq!(
                stuck.error,
                Some(CollectorError::failure("previous update still running"))
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // once the first update returns the collector runs again
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(active.load(Ordering::SeqCst), 0);
        engine.gather().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }
}
