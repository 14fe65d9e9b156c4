//! Configuration management for the daemon.
//!
//! The file holds the engine configuration at the top level plus a
//! `daemon` section for settings the engine itself does not know about.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

use vmfleet_engine::{EndpointConfig, EngineConfig};

use crate::cli::Args;

/// Location tried when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmfleet/vmfleetd.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon-only settings
    pub daemon: DaemonConfig,
    /// Everything handed to the engine
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        for spec in &args.endpoints {
            let endpoint = parse_endpoint(spec)?;
            self.engine.endpoints.retain(|e| e.name != endpoint.name);
            self.engine.endpoints.push(endpoint);
        }

        if let Some(secs) = args.connect_timeout {
            self.engine.connection.connect_timeout_secs = secs;
        }

        if let Some(secs) = args.stats_interval {
            self.engine.stats.report_interval_secs = secs;
        }

        if args.dev {
            self.daemon.backend = Backend::Mock;
        }

        Ok(self)
    }

    /// Seed the two demo endpoints used by `--dev` when none are configured.
    pub fn with_dev_endpoints(mut self) -> Self {
        if self.daemon.backend == Backend::Mock && self.engine.endpoints.is_empty() {
            for (name, uri) in [("local", "qemu:///system"), ("node2", "qemu+ssh://node2/system")] {
                let mut endpoint = EndpointConfig::new(name, uri);
                endpoint.autoconnect = true;
                self.engine.endpoints.push(endpoint);
            }
        }
        self
    }
}

/// `NAME=URI`, autoconnect on.
fn parse_endpoint(spec: &str) -> Result<EndpointConfig> {
    let (name, uri) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid endpoint '{}', expected NAME=URI", spec))?;
    let (name, uri) = (name.trim(), uri.trim());
    if name.is_empty() || uri.is_empty() {
        return Err(anyhow!("invalid endpoint '{}', expected NAME=URI", spec));
    }

    let mut endpoint = EndpointConfig::new(name, uri);
    endpoint.autoconnect = true;
    Ok(endpoint)
}

/// Daemon-only configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Backend used to open endpoints
    pub backend: Backend,
    /// Log every lifecycle event at info level
    pub log_events: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Libvirt,
            log_events: true,
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-memory hosts with demo data
    Mock,
    /// Libvirt/QEMU
    Libvirt,
}
