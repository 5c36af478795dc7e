// Metrics Pusher - Server Monitoring Agent
//
// Scrapes host and container metrics on a fixed interval and pushes them to
// a Prometheus-compatible gateway.
//
// # Features
// - Load average, memory, filesystem, CPU and network monitoring
// - Docker container statistics
// - One push job per module, each on its own schedule
// - Systemd integration for production deployment
//
// # Usage
// metrics-pusher --config <path> [--once]
//
// Example:
// metrics-pusher --config /etc/metrics-pusher/config.toml

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use metrics_pusher::config::AgentConfig;
use metrics_pusher::metrics::{register_docker_collectors, register_node_collectors};
use metrics_pusher::module::{Module, ModuleManager, PushModule};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(version, about = "Pushes host and container metrics to a metrics gateway")]
struct Args {
    /// Path to the TOML settings file
    #[arg(
        short,
        long,
        env = "METRICS_PUSHER_CONFIG",
        default_value = "/etc/metrics-pusher/config.toml"
    )]
    config: PathBuf,

    /// Run one cycle per module and exit
    #[arg(long)]
    once: bool,
}

/// Application entry point
///
/// This function:
/// 1. Parses command-line arguments
/// 2. Initializes logging
/// 3. Loads configuration
/// 4. Builds one push module per enabled section
/// 5. Runs once, or starts the modules until SIGINT/SIGTERM
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    info!("=== Metrics Pusher Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load(&args.config).context("Failed to load configuration")?;
    info!("Gateway: {}", mask_credentials(&config.gateway.url));

    let modules = build_modules(&config)?;
    if modules.is_empty() {
        warn!("No modules enabled, nothing to do");
        return Ok(());
    }

    if args.once {
        return run_once(modules).await;
    }

    let mut signals = ShutdownSignals::install()?;
    let mut manager = ModuleManager::new();
    for module in modules {
        if let Err(e) = manager.register(module) {
            manager.unload().await;
            return Err(e);
        }
    }

    info!("=== Metrics Pusher Started Successfully ===");
    info!("Modules: {}", manager.modules().join(", "));
    info!("Press Ctrl+C to stop");

    let signal = signals.wait().await?;
    info!("{} received, stopping modules", signal);
    manager.unload().await;
    info!("=== Metrics Pusher Stopped ===");
    Ok(())
}

/// Process shutdown signals: Ctrl+C everywhere, plus SIGTERM on unix, which
/// is what `systemctl stop` sends.
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Installs the handlers. Signals arriving after this are not lost.
    fn install() -> Result<Self> {
        Ok(ShutdownSignals {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?,
        })
    }

    /// Waits for the first shutdown signal and returns its name.
    async fn wait(&mut self) -> Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl+C")?;
                    Ok("SIGINT")
                }
                _ = self.terminate.recv() => Ok("SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            Ok("Ctrl+C")
        }
    }
}

/// Builds the enabled modules with their collectors registered.
fn build_modules(config: &AgentConfig) -> Result<Vec<PushModule>> {
    let mut modules = Vec::new();

    if config.node.enabled {
        let mut module = PushModule::new("node", config.gateway.clone());
        if let Some(registry) = module.registry_mut() {
            register_node_collectors(registry, &config.node.exclude)
                .context("Failed to register node collectors")?;
            info!("node module: {} collector(s)", registry.len());
        }
        modules.push(module);
    }

    if config.docker.enabled {
        let mut module = PushModule::new("docker", config.gateway.clone());
        if let Some(registry) = module.registry_mut() {
            register_docker_collectors(registry, &config.docker.exclude)
                .context("Failed to register docker collectors")?;
            info!("docker module: {} collector(s)", registry.len());
        }
        modules.push(module);
    }

    Ok(modules)
}

/// Runs one cycle per module; fails if any module's cycle failed.
async fn run_once(modules: Vec<PushModule>) -> Result<()> {
    let mut failed = Vec::new();
    for module in modules {
        let name = module.name().to_string();
        match module.run_once().await {
            Ok(report) => info!(
                module = %name,
                families = report.families,
                samples = report.samples,
                failed_collectors = report.failed_collectors,
                bytes = report.bytes,
                "Pushed once"
            ),
            Err(e) => {
                error!(module = %name, error = %e, "Single cycle failed");
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        bail!("cycle failed for module(s): {}", failed.join(", "));
    }
    Ok(())
}

/// Initializes the logging subsystem
///
/// Sets up structured logging with:
/// - Colored, human-readable output in a terminal
/// - JSON output when running as a systemd service
///
/// # Log Levels
/// Default: INFO
/// Can be overridden with RUST_LOG environment variable
///
/// # Examples
/// ```bash
/// RUST_LOG=debug metrics-pusher ...                   # Per-cycle summaries
/// RUST_LOG=metrics_pusher::push=debug metrics-pusher  # Only push details
/// ```
fn init_logging() {
    // Systemd sets INVOCATION_ID for every unit it starts
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Masks the password of a gateway URL with userinfo.
///
/// `https://user:secret@gw:9091` becomes `https://user:****@gw:9091`.
fn mask_credentials(url: &str) -> String {
    let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);
    let authority_end = url[authority_start..]
        .find('/')
        .map(|i| authority_start + i)
        .unwrap_or(url.len());

    if let Some(at) = url[authority_start..authority_end].rfind('@') {
        let at = authority_start + at;
        if let Some(colon) = url[authority_start..at].find(':') {
            let mut masked = url.to_string();
            masked.replace_range(authority_start + colon + 1..at, "****");
            return masked;
        }
    }
    url.to_string()
}
