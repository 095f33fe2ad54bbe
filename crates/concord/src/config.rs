//! Configuration for a [`PresenceDirectory`](crate::PresenceDirectory) and
//! its [`Reaper`](crate::Reaper).
//!
//! Every field has a default, so an empty TOML table is a valid config:
//!
//! ```toml
//! lock_timeout_ms = 5000
//! max_concurrent_ops = 64
//!
//! [reaper]
//! tick_ms = 1000
//! contact_idle_ms = 600000
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Loading a config failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The TOML was malformed or had wrongly typed fields.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Directory settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Upper bound on one cluster lock round-trip.
    pub lock_timeout_ms: u64,
    /// Number of directory operations that may run at once.
    pub max_concurrent_ops: usize,
    /// Name prefix for placeholder contacts.
    pub shadow_name_prefix: String,
    /// Periodic sweep settings.
    pub reaper: ReaperConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            max_concurrent_ops: 64,
            shadow_name_prefix: String::from("Cube-"),
            reaper: ReaperConfig::default(),
        }
    }
}

impl DirectoryConfig {
    /// Creates the default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Sets the lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the concurrency bound.
    pub fn max_concurrent_ops(mut self, n: usize) -> Self {
        self.max_concurrent_ops = n;
        self
    }

    /// Sets the reaper settings.
    pub fn reaper(mut self, reaper: ReaperConfig) -> Self {
        self.reaper = reaper;
        self
    }

    /// Lock timeout as a duration.
    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Reaper cadence and idle thresholds.
///
/// Cadences count ticks: with `tick_ms = 1000` and `contact_every = 10`
/// contacts are swept every ten seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Scheduler period.
    pub tick_ms: u64,
    /// Ticks between contact sweeps.
    pub contact_every: u32,
    /// Ticks between group active-time flushes.
    pub group_every: u32,
    /// Ticks between appendix sweeps.
    pub appendix_every: u32,
    /// Idle time after which a contact without devices is evicted.
    pub contact_idle_ms: u64,
    /// Idle time after which a cached appendix is evicted.
    pub appendix_idle_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            contact_every: 10,
            group_every: 5,
            appendix_every: 10,
            contact_idle_ms: 10 * 60 * 1_000,
            appendix_idle_ms: 60 * 1_000,
        }
    }
}

impl ReaperConfig {
    /// Creates the default reaper config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scheduler period.
    pub fn tick(mut self, period: Duration) -> Self {
        self.tick_ms = period.as_millis() as u64;
        self
    }

    /// Sets the three cadences.
    pub fn cadence(mut self, contacts: u32, groups: u32, appendices: u32) -> Self {
        self.contact_every = contacts;
        self.group_every = groups;
        self.appendix_every = appendices;
        self
    }

    /// Sets the contact idle threshold.
    pub fn contact_idle(mut self, idle: Duration) -> Self {
        self.contact_idle_ms = idle.as_millis() as u64;
        self
    }

    /// Sets the appendix idle threshold.
    pub fn appendix_idle(mut self, idle: Duration) -> Self {
        self.appendix_idle_ms = idle.as_millis() as u64;
        self
    }
}
