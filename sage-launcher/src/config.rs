//! `sage.toml` - launcher configuration at the medium root
//!
//! Every field is optional. A missing file means "all defaults", which is the
//! layout the SAGE drive ships with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::defaults;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root of `sage.toml`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    pub backend: ServiceConfig,
    /// No frontend process is managed when the section is absent.
    pub frontend: Option<ServiceConfig>,
    pub ports: PortsConfig,
    pub readiness: ReadinessConfig,
    pub watchdog: WatchdogConfig,
    pub release_delay_ms: u64,
    /// How long a stopped process gets before it is killed.
    pub shutdown_grace_ms: u64,
}

/// `[backend]` / `[frontend]`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Program and arguments. `python3` and `node` prefer the copies bundled
    /// on the medium.
    pub command: Vec<String>,
    /// Relative to the medium root.
    pub working_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub env: BTreeMap<String, String>,
}

/// `[ports]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortsConfig {
    /// Freed before startup, whoever holds them.
    pub owned: Vec<u16>,
}

/// `[readiness]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub interval_ms: u64,
    pub deadline_secs: u64,
    pub health_path: String,
}

/// `[watchdog]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Defaults to the medium root.
    pub sentinel: Option<PathBuf>,
    pub interval_secs: u64,
    /// Shortcut files removed once the medium is gone.
    pub affordances: Vec<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            backend: ServiceConfig {
                command: vec!["python3".to_string(), "main.py".to_string()],
                working_dir: Some(PathBuf::from("backend")),
                port: Some(defaults::BACKEND_PORT),
                env: BTreeMap::new(),
            },
            frontend: None,
            ports: PortsConfig::default(),
            readiness: ReadinessConfig::default(),
            watchdog: WatchdogConfig::default(),
            release_delay_ms: defaults::PORT_RELEASE_DELAY.as_millis() as u64,
            shutdown_grace_ms: defaults::SHUTDOWN_GRACE.as_millis() as u64,
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            owned: defaults::OWNED_PORTS.to_vec(),
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::READINESS_INTERVAL.as_millis() as u64,
            deadline_secs: defaults::READINESS_DEADLINE.as_secs(),
            health_path: sage_core::DEFAULT_HEALTH_PATH.to_string(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sentinel: None,
            interval_secs: defaults::WATCHDOG_INTERVAL.as_secs(),
            affordances: Vec::new(),
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl LauncherConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No launcher config, using defaults");
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.fill_backend_defaults();
        config.validate()?;
        Ok(config)
    }

    /// A `[backend]` section that only sets, say, `env` still runs the stock
    /// backend.
    fn fill_backend_defaults(&mut self) {
        let stock = Self::default().backend;
        if self.backend.command.is_empty() {
            self.backend.command = stock.command;
            if self.backend.working_dir.is_none() {
                self.backend.working_dir = stock.working_dir;
            }
        }
        if self.backend.port.is_none() {
            self.backend.port = stock.port;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.command.is_empty() {
            return Err(ConfigError::Validation(
                "[backend] command must not be empty".to_string(),
            ));
        }
        if let Some(frontend) = &self.frontend
            && frontend.command.is_empty()
        {
            return Err(ConfigError::Validation(
                "[frontend] command must not be empty".to_string(),
            ));
        }
        if self.readiness.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "[readiness] interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.readiness.deadline_secs == 0 {
            return Err(ConfigError::Validation(
                "[readiness] deadline_secs must be greater than 0".to_string(),
            ));
        }
        if self.watchdog.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "[watchdog] interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.ports.owned.contains(&0) || self.backend.port == Some(0) {
            return Err(ConfigError::Validation("port 0 is not allowed".to_string()));
        }
        Ok(())
    }

    pub fn backend_port(&self) -> u16 {
        self.backend.port.unwrap_or(defaults::BACKEND_PORT)
    }

    pub fn backend_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.backend_port())
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness.interval_ms)
    }

    pub fn readiness_deadline(&self) -> Duration {
        Duration::from_secs(self.readiness.deadline_secs)
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.release_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

}
