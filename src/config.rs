use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::pipeline::top::DEFAULT_LIMIT;
use crate::pipeline::PipelineSettings;
use crate::source::parse_source_url;

/// Top-level configuration for the relay.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upstream event stream configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Relay HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Stream transformation tunables.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Upstream event stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Server-sent event stream URL (e.g., "http://localhost:8081/subscribe/eps").
    #[serde(default)]
    pub url: String,

    /// Time allowed to connect and receive response headers. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Relay HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Stream transformation tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Window length of the per-second views. Default: 1s.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Top-N limit used when a request gives none or an invalid one. Default: 10.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Per-subscriber output buffer. A full buffer pauses reading upstream. Default: 64.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_window() -> Duration {
    Duration::from_secs(1)
}

fn default_limit() -> usize {
    DEFAULT_LIMIT.get()
}

fn default_buffer() -> usize {
    64
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            default_limit: default_limit(),
            buffer: default_buffer(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse configuration from YAML text without validating it.
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("decoding YAML")
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.url.is_empty() {
            bail!("source.url is required");
        }
        parse_source_url(&self.source.url).context("invalid source.url")?;

        if self.pipeline.window.is_zero() {
            bail!("pipeline.window must be positive");
        }

        if self.pipeline.default_limit == 0 {
            bail!("pipeline.default_limit must be positive");
        }

        if self.pipeline.buffer == 0 {
            bail!("pipeline.buffer must be positive");
        }

        if self.server.addr == self.health.addr {
            bail!(
                "server.addr and health.addr must differ (both {})",
                self.server.addr
            );
        }

        Ok(())
    }
}

impl PipelineConfig {
    /// Pipeline settings derived from this configuration.
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            window: self.window,
            buffer: self.buffer,
        }
    }

    /// The default top-N limit, falling back to 10 when unset.
    pub fn default_limit(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.default_limit).unwrap_or(DEFAULT_LIMIT)
    }
}
