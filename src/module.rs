// Module lifecycle - one push job per module
//
// A module owns a namespace registry until it starts. Starting freezes the
// registry into a scrape engine, binds a push client, and spawns the
// scheduler. The manager starts modules in order and stops them in the same
// order on unload.

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ConfigError, GatewaySettings};
use crate::metrics::{NamespaceRegistry, RegistryError};
use crate::push::{PushClient, PushError, PushTarget};
use crate::scheduler::{CycleError, CycleReport, Scheduler};
use crate::scrape::ScrapeEngine;

/// Errors that keep a module from starting or running
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("module {0} is already started")]
    AlreadyStarted(String),
}

/// A unit the manager can start and stop.
#[async_trait]
pub trait Module: Send {
    fn name(&self) -> &str;

    /// Starts background work. Must not block.
    fn start(&mut self) -> Result<(), ModuleError>;

    /// Stops background work and waits for it to finish.
    async fn stop(&mut self);
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Scrapes one namespace and pushes it under job `<name>`.
pub struct PushModule {
    name: String,
    settings: GatewaySettings,
    registry: Option<NamespaceRegistry>,
    running: Option<Running>,
}

impl PushModule {
    /// Creates a module whose namespace and push job are both `name`.
    pub fn new(name: impl Into<String>, settings: GatewaySettings) -> Self {
        let name = name.into();
        PushModule {
            registry: Some(NamespaceRegistry::new(name.clone())),
            name,
            settings,
            running: None,
        }
    }

    /// The registry collectors are added to before the module starts.
    ///
    /// Returns `None` once the module has started.
    pub fn registry_mut(&mut self) -> Option<&mut NamespaceRegistry> {
        self.registry.as_mut()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Runs a single gather → encode → push cycle without scheduling.
    pub async fn run_once(mut self) -> Result<CycleReport, ModuleError> {
        let scheduler = self.build_scheduler()?;
        Ok(scheduler.run_cycle().await?)
    }

    // The registry is only taken once target and client are known good, so a
    // configuration error leaves the module untouched.
    fn build_scheduler(&mut self) -> Result<Scheduler, ModuleError> {
        if self.registry.is_none() {
            return Err(ModuleError::AlreadyStarted(self.name.clone()));
        }

        let target = PushTarget::resolve(&self.settings, &self.name)?;
        let client = PushClient::new(
            target,
            self.settings.auth_header(),
            self.settings.push_timeout(),
        )?;
        info!(module = %self.name, target = ?client.target(), "Push target resolved");

        let registry = self
            .registry
            .take()
            .ok_or_else(|| ModuleError::AlreadyStarted(self.name.clone()))?;
        let engine = ScrapeEngine::new(registry, self.settings.collector_timeout())?;

        Ok(Scheduler::new(engine, client, self.settings.evaluation()))
    }
}

#[async_trait]
impl Module for PushModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), ModuleError> {
        let scheduler = self.build_scheduler()?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        self.running = Some(Running { shutdown, handle });
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.cancel();
        if let Err(e) = running.handle.await {
            error!(module = %self.name, error = %e, "Push loop ended abnormally");
        }
    }
}

/// Starts modules and stops them in registration order.
#[derive(Default)]
pub struct ModuleManager {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `module` and keeps it for `unload`.
    ///
    /// # Errors
    /// The module's start error, with the module name as context. A module
    /// that fails to start is not kept; previously registered modules keep
    /// running until `unload`.
    pub fn register(&mut self, module: impl Module + 'static) -> anyhow::Result<()> {
        let mut module = module;
        module
            .start()
            .with_context(|| format!("{} module failed to start", module.name()))?;
        info!(module = module.name(), "Module started");
        self.modules.push(Box::new(module));
        Ok(())
    }

    /// Names of the running modules, in registration order.
    pub fn modules(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Stops every module in registration order.
    pub async fn unload(&mut self) {
        for mut module in self.modules.drain(..) {
            module.stop().await;
            info!(module = module.name(), "Module stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Collector, CollectorError, MetricDesc, Sample, SampleSink};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fake {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Module for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn start(&mut self) -> Result<(), ModuleError> {
            if self.fail {
                return Err(ConfigError::MissingGatewayToken.into());
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&mut self) {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }
    }

    struct Up(Arc<MetricDesc>);

    #[async_trait]
    impl Collector for Up {
        async fn update(&self, sink: &SampleSink) -> Result<(), CollectorError> {
            sink.emit(Sample::gauge(&self.0, 1.0)?);
            Ok(())
        }
    }

    fn settings(url: &str) -> GatewaySettings {
        GatewaySettings {
            url: url.to_string(),
            token: "tok".to_string(),
            instance: "h1".to_string(),
            evaluation: 60,
            ..Default::default()
        }
    }

    fn module_with_collector(url: &str) -> PushModule {
        let mut module = PushModule::new("app", settings(url));
        let registry = module.registry_mut().unwrap();
        let desc = registry.desc("", "up", "Whether the app is up.", &[]).unwrap();
        registry.register("up", Up(desc)).unwrap();
        module
    }

    #[tokio::test]
    async fn test_manager_fails_fast_and_unloads_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fake = |name, fail| Fake {
            name,
            fail,
            log: Arc::clone(&log),
        };

        let mut manager = ModuleManager::new();
        manager.register(fake("node", false)).unwrap();
        manager.register(fake("docker", false)).unwrap();
        let err = manager.register(fake("broken", true)).unwrap_err();
        assert_eq!(err.to_string(), "broken module failed to start");
        assert_eq!(manager.modules(), vec!["node", "docker"]);

        manager.unload().await;
        assert!(manager.modules().is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start node", "start docker", "stop node", "stop docker"]
        );
    }

    #[tokio::test]
    async fn test_start_without_token_fails_and_keeps_registry() {
        let mut module = PushModule::new("node", GatewaySettings {
            url: "http://gw".to_string(),
            ..Default::default()
        });
        let err = module.start().unwrap_err();
        assert!(matches!(err, ModuleError::Config(ConfigError::MissingGatewayToken)));
        assert!(!module.is_running());
        assert!(module.registry_mut().is_some());
    }

    #[tokio::test]
    async fn test_start_twice_and_stop() {
        let mut module = module_with_collector("http://127.0.0.1:1");
        module.start().unwrap();
        assert!(module.is_running());
        assert!(module.registry_mut().is_none());
        assert!(matches!(module.start(), Err(ModuleError::AlreadyStarted(_))));

        tokio::time::timeout(Duration::from_secs(2), module.stop())
            .await
            .expect("stop did not return");
        assert!(!module.is_running());
    }

    #[tokio::test]
    async fn test_run_once_pushes_under_module_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics/job/app/instance/h1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let report = module_with_collector(&server.uri()).run_once().await.unwrap();
        assert_eq!(report.failed_collectors, 0);
        assert_eq!(report.families, 3);

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(body.contains("app_up 1\n"));
        assert!(body.contains("app_scrape_collector_success{collector=\"up\"} 1\n"));
    }
}
