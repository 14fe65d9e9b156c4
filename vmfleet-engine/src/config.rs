//! Engine configuration.
//!
//! The engine takes an immutable snapshot at construction and on every
//! explicit reload; loading it from disk is the caller's business.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmfleet_hypervisor::MigrationFlags;

use crate::error::{EngineError, Result};
use crate::query::Operation;

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Configured hypervisor endpoints
    pub endpoints: Vec<EndpointConfig>,
    pub connection: ConnectionConfig,
    pub cache: CacheConfig,
    pub events: EventsConfig,
    pub migration: MigrationConfig,
    pub stats: StatsConfig,
}

/// One hypervisor endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Identifier used everywhere else
    pub name: String,
    /// Connection URI, e.g. `qemu+ssh://root@node2/system`
    pub uri: String,
    /// Connect at startup
    #[serde(default)]
    pub autoconnect: bool,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            autoconnect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound of a connect attempt
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries per (endpoint, operation) bucket
    pub capacity_per_bucket: usize,
    /// Per-operation TTL overrides in seconds; `null` disables expiry
    pub ttl_secs: BTreeMap<Operation, Option<u64>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_per_bucket: 256,
            ttl_secs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events held per consumer before the oldest is dropped
    pub consumer_queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            consumer_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Upper bound of the compatibility check
    pub preflight_timeout_secs: u64,
    /// Terminal jobs kept for status queries
    pub archive_capacity: usize,
    /// Flags used when a request does not specify any
    pub default_flags: MigrationFlags,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            preflight_timeout_secs: 30,
            archive_capacity: 100,
            default_flags: MigrationFlags {
                live: true,
                persistent: true,
                ..Default::default()
            },
        }
    }
}

impl MigrationConfig {
    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_secs(self.preflight_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Period of the statistics log line; 0 disables the reporter
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 60,
        }
    }
}

fn invalid(field: &str, message: &str) -> EngineError {
    EngineError::InvalidConfig(format!("{}: {}", field, message))
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.name.trim().is_empty() {
                return Err(invalid(&format!("endpoints[{}].name", i), "must not be empty"));
            }
            if endpoint.uri.trim().is_empty() {
                return Err(invalid(&format!("endpoints[{}].uri", i), "must not be empty"));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(invalid(
                    &format!("endpoints[{}].name", i),
                    &format!("duplicate endpoint '{}'", endpoint.name),
                ));
            }
        }

        if self.connection.connect_timeout_secs == 0 {
            return Err(invalid("connection.connect_timeout_secs", "must be greater than 0"));
        }
        if self.cache.capacity_per_bucket == 0 {
            return Err(invalid("cache.capacity_per_bucket", "must be greater than 0"));
        }
        if self.events.consumer_queue_capacity == 0 {
            return Err(invalid("events.consumer_queue_capacity", "must be greater than 0"));
        }
        if self.migration.preflight_timeout_secs == 0 {
            return Err(invalid("migration.preflight_timeout_secs", "must be greater than 0"));
        }
        if self.migration.archive_capacity == 0 {
            return Err(invalid("migration.archive_capacity", "must be greater than 0"));
        }

        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}
