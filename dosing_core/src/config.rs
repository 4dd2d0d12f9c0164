//! Configuration file support for dosecalc.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/dosecalc/config.toml`.
//! The idle timeout and feedback thresholds are workflow constants, not
//! settings.

use crate::instruments::{build_default_catalog, InstrumentCatalog, InstrumentSpec};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub instruments: InstrumentsConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Dose history configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Logged doses kept before the store reports the limit (0 = unlimited)
    #[serde(default = "default_max_logged_doses")]
    pub max_logged_doses: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_logged_doses: default_max_logged_doses(),
        }
    }
}

/// Extra syringes on top of the built-in table
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct InstrumentsConfig {
    #[serde(default)]
    pub custom: Vec<InstrumentSpec>,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("dosecalc")
}

fn default_max_logged_doses() -> usize {
    500
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("dosecalc").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject custom syringes whose marking tables cannot be built
    pub fn validate(&self) -> Result<()> {
        self.instrument_catalog().map(|_| ())
    }

    /// Built-in syringes merged with the configured custom ones
    pub fn instrument_catalog(&self) -> Result<InstrumentCatalog> {
        let mut catalog = build_default_catalog();
        catalog
            .merge_specs(&self.instruments.custom)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(catalog)
    }

    pub fn doses_path(&self) -> PathBuf {
        self.data.data_dir.join("doses.jsonl")
    }

    pub fn prompts_path(&self) -> PathBuf {
        self.data.data_dir.join("prompts.json")
    }
}
