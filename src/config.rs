//! Daemon configuration loaded from `.modulard/config.toml`.
//!
//! Every field has a default, so a missing file yields a working daemon.
//! Command-line flags are applied on top with [`DaemonConfig::apply_overrides`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{DaemonError, Result};

/// Name of the configuration file inside the storage directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Order in which ready modules are dispatched to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingPolicy {
    /// Highest fan-in first across the whole graph.
    #[default]
    FanIn,
    /// Finish one translation unit's subgraph before starting the next.
    TuAtATime,
}

impl std::str::FromStr for SchedulingPolicy {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fan-in" => Ok(SchedulingPolicy::FanIn),
            "tu-at-a-time" => Ok(SchedulingPolicy::TuAtATime),
            other => Err(DaemonError::Config(format!(
                "unknown scheduling policy '{other}' (expected fan-in or tu-at-a-time)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub toolchain: ToolchainSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Seconds with no live connection before the daemon exits.
    pub idle_timeout_secs: u64,
    /// Upper bound on concurrent module builds.
    pub max_concurrency: usize,
    pub policy: SchedulingPolicy,
    /// Read/write timeout applied to each client socket.
    pub io_timeout_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            policy: SchedulingPolicy::FanIn,
            io_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Ttl scale applied on store: `ttl = depth * prune_after`.
    pub prune_after_secs: u64,
    /// Ttl extension applied on reuse: `ttl += depth * prune_extend`.
    pub prune_extend_secs: u64,
    /// Period of the background sweeper.
    pub prune_interval_secs: u64,
    /// Total artifact bytes above which a pressure sweep runs.
    pub max_size_bytes: u64,
    /// Bytes an interval sweep tries to free; 0 evicts every expired entry.
    pub reclaim_target_bytes: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            prune_after_secs: 3600,
            prune_extend_secs: 900,
            prune_interval_secs: 600,
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            reclaim_target_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainSection {
    /// Dependency scanner executable (P1689 output).
    pub scanner: String,
    /// File extension given to module artifacts.
    pub artifact_extension: String,
}

impl Default for ToolchainSection {
    fn default() -> Self {
        Self {
            scanner: "clang-scan-deps".to_string(),
            artifact_extension: "pcm".to_string(),
        }
    }
}

/// Values supplied on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub idle_timeout_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub policy: Option<SchedulingPolicy>,
}

impl DaemonConfig {
    /// Load `<storage_root>/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load(storage_root: &Path) -> Result<Self> {
        let path = storage_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DaemonConfig =
            toml::from_str(content).map_err(|e| DaemonError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(secs) = overrides.idle_timeout_secs {
            self.daemon.idle_timeout_secs = secs;
        }
        if let Some(n) = overrides.max_concurrency {
            self.daemon.max_concurrency = n;
        }
        if let Some(policy) = overrides.policy {
            self.daemon.policy = policy;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.max_concurrency == 0 {
            return Err(DaemonError::Config(
                "daemon.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.cache.prune_interval_secs == 0 {
            return Err(DaemonError::Config(
                "cache.prune_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.cache.prune_after_secs == 0 {
            return Err(DaemonError::Config(
                "cache.prune_after_secs must be at least 1".to_string(),
            ));
        }
        if self.cache.max_size_bytes == 0 {
            return Err(DaemonError::Config(
                "cache.max_size_bytes must be at least 1".to_string(),
            ));
        }
        if self.toolchain.artifact_extension.is_empty() {
            return Err(DaemonError::Config(
                "toolchain.artifact_extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.idle_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.io_timeout_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.cache.prune_interval_secs)
    }
}
