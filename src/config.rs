//! Station configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. An optional TOML file (base configuration)
//! 2. Environment variables (prefixed with `SWEEP_`)
//!
//! The storage root is an explicit configuration value passed to the
//! station at construction; there is no process-wide default directory.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SWEEP_DATA_DIR=/data/cooldown_7
//! SWEEP_SOURCE_FILE=transmission_vs_gate.rs
//! SWEEP_FSYNC_EVERY=50
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, StationError};

fn default_fsync_every() -> usize {
    10
}

/// Configuration for a [`crate::Station`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Storage root. Each run becomes a numbered subdirectory here.
    pub data_dir: PathBuf,
    /// Identifier of the file the measurement code runs from, recorded in
    /// run metadata when set.
    #[serde(default)]
    pub source_file: Option<String>,
    /// Rows between fsyncs of the data file while a run is open.
    #[serde(default = "default_fsync_every")]
    pub fsync_every: usize,
}

impl StationConfig {
    /// Build a configuration with just a storage root.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            source_file: None,
            fsync_every: default_fsync_every(),
        }
    }

    /// Record the originating-file identifier in run metadata.
    pub fn with_source_file(mut self, source_file: impl Into<String>) -> Self {
        self.source_file = Some(source_file.into());
        self
    }

    /// Load configuration from a TOML file plus `SWEEP_` environment
    /// variable overrides.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SWEEP_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only, on top of the
    /// given defaults.
    pub fn load_with_defaults(defaults: Self) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(defaults))
            .merge(Env::prefixed("SWEEP_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate semantic constraints that parsing cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StationError::InvalidConfig(
                "data_dir must not be empty".to_string(),
            ));
        }
        if self.fsync_every == 0 {
            return Err(StationError::InvalidConfig(
                "fsync_every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_new_defaults() {
        let config = StationConfig::new("/tmp/runs");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.fsync_every, 10);
        assert!(config.source_file.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "data_dir = \"/data/cooldown_7\"\nsource_file = \"gate_sweep.rs\"\nfsync_every = 25"
        )
        .unwrap();

        let config = StationConfig::load(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/data/cooldown_7"));
        assert_eq!(config.source_file.as_deref(), Some("gate_sweep.rs"));
        assert_eq!(config.fsync_every, 25);
    }

    #[test]
    fn test_validate_rejects_zero_fsync() {
        let mut config = StationConfig::new("/tmp/runs");
        config.fsync_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_data_dir() {
        let config = StationConfig::new("");
        assert!(config.validate().is_err());
    }
}
