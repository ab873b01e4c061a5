//! Runner configuration.
//!
//! Loaded via the `config` crate from an optional `copper-relay.toml` in the
//! working directory, then from `COPPER_RELAY__*` environment variables
//! (e.g. `COPPER_RELAY__ENGINE__MAX_CONCURRENCY=4`).

use copper_relay_workflow::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runner configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Directory scanned for `*.json` workflow bundles.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Engine limits.
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("./workflows")
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            log_filter: default_log_filter(),
            engine: EngineConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Loads configuration from `copper-relay.toml` (if present) and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or a value is invalid.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(Path::new("copper-relay.toml"))
    }

    /// Like [`RunnerConfig::load`] with an explicit file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or a value is invalid.
    pub fn load_from(file: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(
                config::Environment::with_prefix("COPPER_RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
