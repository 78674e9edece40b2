use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::decay::DecayConfig;
use crate::logging::LogConfig;
use crate::models::{EnergyConfig, HrvDrainConfig, SleepConfig};
use crate::optimizer::OptimizerConfig;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Application metadata
    pub metadata: ConfigMetadata,

    /// Energy model parameters, replaced by fitted values after `fit --save`
    pub energy: EnergyConfig,

    /// Sleep detection thresholds
    pub sleep: SleepConfig,

    /// HRV drain multipliers
    pub hrv: HrvDrainConfig,

    /// Decay fallback settings
    pub decay: DecayConfig,

    /// Parameter search settings
    pub optimizer: OptimizerConfig,

    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let now = Utc::now();
        ConfigMetadata {
            version: "1.0".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            metadata: ConfigMetadata::default(),
            energy: EnergyConfig::default(),
            sleep: SleepConfig::default(),
            hrv: HrvDrainConfig::default(),
            decay: DecayConfig::default(),
            optimizer: OptimizerConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Configuration management implementation
impl PacingConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: PacingConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise. A file that exists but
    /// fails to parse or validate is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pacing")
            .join("config.toml")
    }

    /// Check every section against its own invariants
    pub fn validate(&self) -> Result<()> {
        self.energy.validate().context("[energy]")?;
        self.sleep.validate().context("[sleep]")?;
        self.hrv.validate().context("[hrv]")?;
        self.optimizer.validate().context("[optimizer]")?;
        Ok(())
    }
}
