//! This module provides functionality for loading and handling the backend configuration.
//!
//! It defines the `BackendConfig` struct, which holds the storage paths and tuning knobs,
//! and a `load_config` function to load the configuration from a YAML file.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use powermem::config::{BackendConfig, load_config};
//!
//! let config_file_path = "/path/to/config.yaml";
//! let config: BackendConfig = load_config(config_file_path).unwrap();
//! println!("{:?}", config);
//! ```
//!
//! A complete file looks like:
//!
//! ```yaml
//! db_path: "/var/lib/powermem/powermem.db"
//! dimension: 384
//! search_overfetch: 2
//! busy_timeout_ms: 5000
//! snapshot_recovery: fail
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::*;

use crate::error::{MemoryError, Result};
use crate::snapshot::SnapshotPaths;

/// Embedding length produced by the default embedding service (text-embedding-v1).
pub const DEFAULT_DIMENSION: usize = 384;

/// What to do when the snapshot pair on disk is unusable at startup.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotRecovery {
    /// Refuse to open; the operator decides.
    #[default]
    Fail,
    /// Move the bad files aside, log it, and start with an empty index.
    StartEmpty,
}

/// Represents the backend's configuration.
///
/// Only `db_path` is required in the YAML file; everything else has a default.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BackendConfig {
    /// The SQLite record store file. Snapshot files live next to it.
    pub db_path: PathBuf,

    /// Length of every embedding.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// How many candidates per requested result the first search pass fetches.
    #[serde(default = "default_overfetch")]
    pub search_overfetch: usize,

    // How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    // Startup behaviour for a corrupt snapshot pair.
    #[serde(default)]
    pub snapshot_recovery: SnapshotRecovery,
}

fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}

fn default_overfetch() -> usize {
    2
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl BackendConfig {
    /// Config with defaults for everything but the database path.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            dimension: default_dimension(),
            search_overfetch: default_overfetch(),
            busy_timeout_ms: default_busy_timeout_ms(),
            snapshot_recovery: SnapshotRecovery::default(),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_snapshot_recovery(mut self, recovery: SnapshotRecovery) -> Self {
        self.snapshot_recovery = recovery;
        self
    }

    /// Reject values the backend cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(MemoryError::InvalidConfig("db_path must not be empty".into()));
        }
        if self.dimension == 0 || i32::try_from(self.dimension).is_err() {
            return Err(MemoryError::InvalidConfig(format!(
                "dimension must be between 1 and {}, got {}",
                i32::MAX,
                self.dimension
            )));
        }
        if self.search_overfetch == 0 {
            return Err(MemoryError::InvalidConfig(
                "search_overfetch must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Snapshot file locations derived from `db_path`.
    pub fn snapshot_paths(&self) -> SnapshotPaths {
        SnapshotPaths::from_db_path(&self.db_path)
    }
}

/// Loads the backend configuration from a YAML file.
///
/// # Parameters
///
/// - `file`: The path to the YAML configuration file.
///
/// # Returns
///
/// - `Ok(BackendConfig)`: The loaded and validated configuration.
/// - `Err(MemoryError)`: The file could not be read, is not valid YAML, or holds values
///   [`BackendConfig::validate`] rejects.
pub fn load_config(file: &str) -> Result<BackendConfig> {
    debug!("Loading config from {}", file);
    let content = fs::read_to_string(file)?;
    let config: BackendConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
