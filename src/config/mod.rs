use serde::Deserialize;
use std::path::{Path, PathBuf};
use config::{Config, ConfigError, File};

/// Where the pretrained weights come from and where they are cached
#[derive(Debug, Deserialize, Clone)]
pub struct WeightsConfig {
    /// HTTP(S) location of a safetensors checkpoint
    pub url: String,
    /// Directory holding downloaded checkpoints
    pub cache_dir: PathBuf,
    /// File name inside `cache_dir`
    pub file_name: String,
}

impl WeightsConfig {
    /// Full path of the cached checkpoint
    pub fn path(&self) -> PathBuf {
        self.cache_dir.join(&self.file_name)
    }
}

/// Configuration for application logging
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g. "info", "effnet_export=debug")
    pub level: String,
    /// Optional log file path; logs go to stderr when unset
    pub file: Option<PathBuf>,
}

/// Main settings struct that contains all configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub weights: WeightsConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Loads settings from `./config`, in the following order of precedence
    /// (highest to lowest):
    /// 1. Local config file (local.toml) if present
    /// 2. Default config file (default.toml) if present
    /// 3. Built-in defaults
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = std::env::current_dir()
            .map_err(|e| ConfigError::Message(
                format!("Failed to get current directory: {}", e)
            ))?
            .join("config");
        Self::from_dir(&config_dir)
    }

    /// Loads settings from the given directory; missing files fall back to defaults.
    pub fn from_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        let default_config = config_dir.join("default.toml");
        let local_config = config_dir.join("local.toml");

        let settings = Config::builder()
            .set_default("weights.url", "https://huggingface.co/timm/efficientnet_b0.ra_in1k/resolve/main/model.safetensors")?
            .set_default("weights.cache_dir", "../models/weights")?
            .set_default("weights.file_name", "efficientnet_b0.ra_in1k.safetensors")?
            .set_default("logging.level", "info")?
            .add_source(File::from(default_config).required(false))
            .add_source(File::from(local_config).required(false))
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.weights.url.starts_with("https://") || self.weights.url.starts_with("http://")) {
            return Err(ConfigError::Message(
                format!("weights.url must be an http(s) URL, got: {}", self.weights.url)
            ));
        }

        if self.weights.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::Message(
                "weights.cache_dir must not be empty".to_string()
            ));
        }

        if self.weights.file_name.is_empty() || self.weights.file_name.contains(['/', '\\']) {
            return Err(ConfigError::Message(
                format!("weights.file_name must be a plain file name, got: {:?}", self.weights.file_name)
            ));
        }

        // Accept plain levels as well as filter directives like "effnet_export=debug"
        tracing_subscriber::EnvFilter::try_new(&self.logging.level).map_err(|e| {
            ConfigError::Message(format!("Invalid logging level {:?}: {}", self.logging.level, e))
        })?;

        // Create log file directory if configured and doesn't exist
        if let Some(log_file) = &self.logging.file {
            if let Some(parent) = log_file.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        ConfigError::Message(format!(
                            "Failed to create log directory at {}: {}",
                            parent.display(), e
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }
}
