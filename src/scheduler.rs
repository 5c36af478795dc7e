// Scheduler module - drives one module's gather → encode → push cycle
//
// # Architecture
// - One Tokio task per module runs `Scheduler::run`
// - The loop sleeps for the evaluation interval, then runs one cycle to
//   completion, then sleeps again. A cycle that overruns the interval
//   simply delays the next one; firings never pile up.
// - Cycle errors are logged and swallowed; only shutdown ends the loop
// - Shutdown is observed between cycles, so an in-flight push is never cut

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoder::{encode, EncodeError};
use crate::push::{PushClient, PushError};
use crate::scrape::ScrapeEngine;

/// Errors that end one cycle early
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Push(#[from] PushError),
}

/// Summary of one successful cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub families: usize,
    pub samples: usize,
    pub failed_collectors: usize,
    pub bytes: usize,
}

/// Periodic pusher for one module
///
/// Pushes for one module are strictly sequential: cycle N has finished
/// before cycle N+1 starts gathering.
pub struct Scheduler {
    engine: ScrapeEngine,
    client: PushClient,
    interval: Duration,
}

impl Scheduler {
    /// Creates a new Scheduler
    ///
    /// # Arguments
    /// * `engine` - the module's collectors
    /// * `client` - the module's gateway client
    /// * `interval` - pause between the end of one cycle and the next
    pub fn new(engine: ScrapeEngine, client: PushClient, interval: Duration) -> Self {
        Scheduler {
            engine,
            client,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs cycles until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            job = self.engine.namespace(),
            collectors = self.engine.collector_count(),
            interval_secs = self.interval.as_secs_f64(),
            url = self.client.url(),
            "Starting push loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.run_cycle().await {
                Ok(report) => debug!(
                    job = self.engine.namespace(),
                    families = report.families,
                    samples = report.samples,
                    failed_collectors = report.failed_collectors,
                    bytes = report.bytes,
                    "Cycle complete"
                ),
                Err(CycleError::Push(e)) if e.is_unauthorized() => warn!(
                    job = self.engine.namespace(),
                    error = %e,
                    "Push rejected, check gateway token"
                ),
                Err(e) => warn!(job = self.engine.namespace(), error = %e, "Push cycle failed"),
            }
        }

        info!(job = self.engine.namespace(), "Push loop stopped");
    }

    /// Gathers, encodes and pushes once.
    ///
    /// Collector failures do not fail the cycle; they show up as
    /// `scrape_collector_success` samples. Encoding failures abandon the
    /// cycle before anything is sent.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let snapshot = self.engine.gather().await;
        let failed_collectors = snapshot.failed_collectors();
        let samples = snapshot.samples.len();

        let body = encode(&snapshot.samples).map_err(|e| {
            error!(job = self.engine.namespace(), error = %e, "Dropping malformed snapshot");
            e
        })?;
        let families = body.lines().filter(|l| l.starts_with("# TYPE ")).count();
        let bytes = body.len();

        self.client.push(body).await?;

        Ok(CycleReport {
            families,
            samples,
            failed_collectors,
            bytes,
        })
    }
}
