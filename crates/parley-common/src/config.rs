//! ---
//! parley_section: "01-shared-runtime"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Shared primitives for every extension context."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_max_attempts() -> u32 {
    40
}

/// Primary configuration object for a bus-hosting process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub locate: LocateConfig,
}

/// Metadata describing where a [`BusConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedBusConfig {
    pub config: BusConfig,
    pub source: PathBuf,
}

impl BusConfig {
    pub const ENV_CONFIG_PATH: &str = "PARLEY_CONFIG";

    /// Load configuration from disk, respecting the `PARLEY_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedBusConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedBusConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedBusConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<BusConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.locate.validate()
    }
}

impl std::str::FromStr for BusConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: BusConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Behaviour of the host transport when a listener declines synchronously.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostFlavor {
    /// Every listener gets its turn before the call resolves without a reply.
    #[default]
    Lenient,
    /// A listener that declines synchronously closes the reply slot for everyone.
    Strict,
}

impl std::str::FromStr for HostFlavor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lenient" => Ok(HostFlavor::Lenient),
            "strict" => Ok(HostFlavor::Strict),
            other => Err(format!("unknown host flavor: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub flavor: HostFlavor,
}

/// Bounds for locating a long-lived sibling context that may still be starting.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateConfig {
    #[serde(default = "default_retry_interval", rename = "retry_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_interval: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for LocateConfig {
    fn default() -> Self {
        Self {
            retry_interval: default_retry_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl LocateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("locate.max_attempts must be at least 1"));
        }
        Ok(())
    }
}
