//! Configuration management for the command-line front end

use nextflow_spawner_core::SpawnerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Prefix of environment overrides, e.g. `NEXTFLOW_SPAWNER_SPAWNER__WORKFLOW_URL`
pub const ENV_PREFIX: &str = "NEXTFLOW_SPAWNER";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub spawner: SpawnerConfig,
    /// Per-user state files and logs live here
    pub state_dir: PathBuf,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spawner: SpawnerConfig::default(),
            state_dir: default_state_dir(),
            logging: LoggingConfig::default(),
        }
    }
}

/// `~/.nextflow-spawner`, or a relative directory when there is no home
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".nextflow-spawner"))
        .unwrap_or_else(|| PathBuf::from(".nextflow-spawner"))
}

impl Config {
    /// Load configuration from config files, an optional explicit file and the environment
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_default("state_dir", default_state_dir().display().to_string())?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(Error::Configuration(format!(
                    "logging.format must be 'text' or 'json', got '{}'",
                    other
                )))
            }
        }
        self.spawner.validate()?;
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}
