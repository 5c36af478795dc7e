// Configuration module - loads the agent's TOML settings file
//
// This module is responsible for:
// 1. Reading and parsing the settings file
// 2. Applying defaults for optional gateway settings
// 3. Validating the settings a module needs before it starts pushing

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Push interval used when `gateway.evaluation` is zero or missing
pub const DEFAULT_EVALUATION: Duration = Duration::from_secs(5);

/// Push request timeout used when `gateway.timeout` is zero or missing
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Collector deadline used when `gateway.collector_timeout` is zero or missing
pub const DEFAULT_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the bearer token when none is configured
pub const DEFAULT_AUTH_HEADER: &str = "blade-auth";

/// Errors that can occur during configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("gateway url is not configured")]
    MissingGatewayUrl,

    #[error("gateway token is not configured")]
    MissingGatewayToken,

    #[error("gateway instance is unset and the hostname is unavailable: {0}")]
    Hostname(String),
}

/// Main configuration structure
///
/// # Example
/// ```toml
/// [gateway]
/// url = "http://gateway:9091"
/// token = "secret"
/// evaluation = 15
///
/// [node]
/// exclude = ["filesystem"]
///
/// [docker]
/// enabled = true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Host metrics, pushed under job "node"
    #[serde(default = "ModuleSettings::enabled_by_default")]
    pub node: ModuleSettings,

    /// Container metrics, pushed under job "docker"
    #[serde(default)]
    pub docker: ModuleSettings,
}

/// Where and how often to push.
///
/// Durations are whole seconds; zero selects the default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub token: String,

    /// Push instance label; the local hostname when empty
    #[serde(default)]
    pub instance: String,

    /// Seconds between scrape-and-push cycles
    #[serde(default)]
    pub evaluation: u64,

    /// Header name carrying `Bearer <token>`
    #[serde(default)]
    pub auth_header: String,

    /// Push request timeout in seconds
    #[serde(default)]
    pub timeout: u64,

    /// Per-collector deadline in seconds
    #[serde(default)]
    pub collector_timeout: u64,
}

/// Settings for one push module
///
/// A module whose section is present is enabled unless it says otherwise.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Collector names not to register
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ModuleSettings {
    fn enabled_by_default() -> Self {
        ModuleSettings {
            enabled: true,
            exclude: Vec::new(),
        }
    }
}

impl GatewaySettings {
    /// Checks the settings required to push.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingGatewayUrl);
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingGatewayToken);
        }
        Ok(())
    }

    /// The configured instance, or the local hostname when unset.
    pub fn resolve_instance(&self) -> Result<String, ConfigError> {
        if !self.instance.is_empty() {
            return Ok(self.instance.clone());
        }
        hostname::get()
            .map_err(|e| ConfigError::Hostname(e.to_string()))?
            .into_string()
            .map_err(|raw| ConfigError::Hostname(format!("not valid UTF-8: {raw:?}")))
    }

    pub fn evaluation(&self) -> Duration {
        secs_or(self.evaluation, DEFAULT_EVALUATION)
    }

    pub fn push_timeout(&self) -> Duration {
        secs_or(self.timeout, DEFAULT_PUSH_TIMEOUT)
    }

    pub fn collector_timeout(&self) -> Duration {
        secs_or(self.collector_timeout, DEFAULT_COLLECTOR_TIMEOUT)
    }

    pub fn auth_header(&self) -> &str {
        if self.auth_header.is_empty() {
            DEFAULT_AUTH_HEADER
        } else {
            &self.auth_header
        }
    }
}

fn secs_or(secs: u64, default: Duration) -> Duration {
    if secs == 0 {
        default
    } else {
        Duration::from_secs(secs)
    }
}

impl AgentConfig {
    /// Reads and parses the settings file at `path`.
    ///
    /// Missing gateway url/token are not reported here; they are fatal when
    /// a module starts.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AgentConfig = toml::from_str(&content)?;

        info!(
            node = config.node.enabled,
            docker = config.docker.enabled,
            evaluation_secs = config.gateway.evaluation().as_secs(),
            "Configuration loaded"
        );
        Ok(config)
    }
}
