//! Engine configuration.
//!
//! Configuration is loaded from a TOML file. All options have defaults so an
//! empty file (or no file at all) yields a working single-host setup rooted
//! at the default share path.
//!
//! The shared stores (queue, archives, notifications, uploads, metadata,
//! staging) live under `network_root`; `project_root` is separately
//! configurable because the final project tree is commonly a different
//! export with tighter permissions than the data share.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default cap for each archive ring.
pub const DEFAULT_ARCHIVE_CAP: usize = 1000;

/// Default lifetime of a cached reachability probe, in seconds.
pub const DEFAULT_PROBE_CACHE_SECONDS: u64 = 30;

/// Default interval between placement retry sweeps, in seconds.
pub const DEFAULT_RETRY_INTERVAL_SECONDS: u64 = 60;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file {}: {source}", path.display())]
    Unreadable {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("invalid config: {0}")]
    Invalid(#[from] toml::de::Error),
}

/// Engine configuration.
///
/// Unknown keys are rejected so a typo in an option name fails loudly
/// instead of silently falling back to a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Base directory for the shared stores.
    pub network_root: PathBuf,

    /// Local base used when `network_root` fails its reachability probe.
    pub local_fallback_root: PathBuf,

    /// Base for final artifact delivery. Defaults to
    /// `<network_root>/projects` when unset.
    pub project_root: Option<PathBuf>,

    /// Base for staged artifacts awaiting privileged placement. Defaults to
    /// `<network_root>/staging` when unset.
    pub staging_root: Option<PathBuf>,

    /// Maximum records retained per archive ring.
    pub archive_cap: usize,

    /// Lifetime of a cached reachability probe, in seconds.
    pub probe_cache_seconds: u64,

    /// Interval between placement retry sweeps, in seconds.
    pub retry_interval_seconds: u64,

    /// Source consumed by the identity provider. Defaults to
    /// `<network_root>/users.json` when unset.
    pub identity_provider_source: Option<PathBuf>,

    /// Permit state-changing operations while the resolver is degraded.
    ///
    /// Off by default: a divergent local history written during an outage
    /// cannot be merged back into the shared store afterwards.
    pub allow_degraded_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network_root: default_network_root(),
            local_fallback_root: PathBuf::from("data"),
            project_root: None,
            staging_root: None,
            archive_cap: DEFAULT_ARCHIVE_CAP,
            probe_cache_seconds: DEFAULT_PROBE_CACHE_SECONDS,
            retry_interval_seconds: DEFAULT_RETRY_INTERVAL_SECONDS,
            identity_provider_source: None,
            allow_degraded_writes: false,
        }
    }
}

#[cfg(windows)]
fn default_network_root() -> PathBuf {
    PathBuf::from(r"\\fileserver\shared\filegate")
}

#[cfg(not(windows))]
fn default_network_root() -> PathBuf {
    PathBuf::from("/srv/filegate/shared")
}

impl EngineConfig {
    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on malformed TOML or unknown keys.
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unreadable`] when the file cannot be read and
    /// [`ConfigError::Invalid`] when it does not parse.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Resolved base for final artifact delivery.
    #[must_use]
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .unwrap_or_else(|| self.network_root.join("projects"))
    }

    /// Resolved base for staged artifacts.
    #[must_use]
    pub fn staging_root(&self) -> PathBuf {
        self.staging_root
            .clone()
            .unwrap_or_else(|| self.network_root.join("staging"))
    }

    /// Resolved identity provider source.
    #[must_use]
    pub fn identity_source(&self) -> PathBuf {
        self.identity_provider_source
            .clone()
            .unwrap_or_else(|| self.network_root.join("users.json"))
    }
}
