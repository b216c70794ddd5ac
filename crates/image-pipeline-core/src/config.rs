//! Configuration management for the pipeline engine

use crate::error::{ProcessingError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "image-pipeline";
const ENV_PREFIX: &str = "IMAGE_PIPELINE";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub generation: GenerationConfig,
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub output_directory: PathBuf,
    pub temp_directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let defaults = PathDefaults::platform();

        Self {
            database_url: format!("sqlite:{}", data_dir.join("pipeline.db").display()),
            output_directory: defaults.output_directory,
            temp_directory: defaults.temp_directory,
        }
    }
}

/// Retry queue and lookup timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pause after each retry job so progress stays observable
    pub progress_delay_ms: u64,
    /// Delay before the single re-read of a record that was not found
    pub lookup_retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            progress_delay_ms: 100,
            lookup_retry_delay_ms: 250,
        }
    }
}

impl QueueConfig {
    pub fn progress_delay(&self) -> Duration {
        Duration::from_millis(self.progress_delay_ms)
    }

    pub fn lookup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lookup_retry_delay_ms)
    }
}

/// External generator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Shell command producing images, one path per stdout line
    pub command: Option<String>,
    pub polling_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            command: None,
            polling_timeout_secs: 15 * 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `console` or `file`
    pub output_type: String,
    pub output_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output_type: "console".to_string(),
            output_path: None,
        }
    }
}

/// Platform default locations for generated and finished images.
///
/// Jobs resolved on another machine or user account fall back to these when
/// their stored paths are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathDefaults {
    pub output_directory: PathBuf,
    pub temp_directory: PathBuf,
}

impl PathDefaults {
    /// Compute defaults under the current user's documents directory
    pub fn platform() -> Self {
        let base = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self::under(&base)
    }

    /// Defaults rooted at an explicit base directory
    pub fn under(base: &Path) -> Self {
        Self {
            output_directory: base.join("output"),
            temp_directory: base.join("generated"),
        }
    }
}

impl From<&StorageConfig> for PathDefaults {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            output_directory: storage.output_directory.clone(),
            temp_directory: storage.temp_directory.clone(),
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Create a configuration manager with a custom path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load the file (if present) and apply `IMAGE_PIPELINE__SECTION__KEY`
    /// environment overrides on top
    pub fn load_layered(config_path: PathBuf) -> Result<Self> {
        let defaults = toml::to_string(&AppConfig::default()).map_err(|e| {
            ProcessingError::ConfigError {
                message: format!("Failed to serialize default config: {}", e),
            }
        })?;

        let config = ::config::Config::builder()
            .add_source(::config::File::from_str(&defaults, ::config::FileFormat::Toml))
            .add_source(::config::File::from(config_path.clone()).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map_err(|e| ProcessingError::ConfigError {
                message: format!("Failed to load layered config: {}", e),
            })?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Update the configuration
    pub fn update_config(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.save()
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProcessingError::ConfigError {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        let config_str = toml::to_string_pretty(&self.config).map_err(|e| {
            ProcessingError::ConfigError {
                message: format!("Failed to serialize config: {}", e),
            }
        })?;

        std::fs::write(&self.config_path, config_str).map_err(|e| {
            ProcessingError::ConfigError {
                message: format!("Failed to write config file: {}", e),
            }
        })?;

        tracing::info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ProcessingError::ConfigError {
                message: "Could not determine config directory".to_string(),
            })?
            .join(APP_DIR);

        Ok(config_dir.join("config.toml"))
    }

    fn load_or_create_config(path: &Path) -> Result<AppConfig> {
        if path.exists() {
            let config_str = std::fs::read_to_string(path).map_err(|e| {
                ProcessingError::ConfigError {
                    message: format!("Failed to read config file: {}", e),
                }
            })?;

            let config: AppConfig = toml::from_str(&config_str).map_err(|e| {
                ProcessingError::ConfigError {
                    message: format!("Failed to parse config file: {}", e),
                }
            })?;

            tracing::info!("Configuration loaded from {:?}", path);
            Ok(config)
        } else {
            tracing::info!("Using default configuration");
            Ok(AppConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_configs() {
        let app_config = AppConfig::default();
        assert_eq!(app_config.queue.progress_delay_ms, 100);
        assert_eq!(app_config.queue.lookup_retry_delay(), Duration::from_millis(250));
        assert_eq!(app_config.generation.polling_timeout_secs, 900);
        assert!(app_config.storage.database_url.starts_with("sqlite:"));
    }

    #[test]
    fn test_path_defaults_under_base() {
        let defaults = PathDefaults::under(Path::new("/srv/pipeline"));
        assert_eq!(defaults.output_directory, PathBuf::from("/srv/pipeline/output"));
        assert_eq!(defaults.temp_directory, PathBuf::from("/srv/pipeline/generated"));
    }

    #[test]
    fn test_config_manager_creation() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let manager = ConfigManager::with_path(config_path).unwrap();
        assert_eq!(manager.config().logging.level, "info");
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let mut manager = ConfigManager::with_path(config_path.clone()).unwrap();
        let mut config = manager.config().clone();
        config.queue.progress_delay_ms = 5;
        config.generation.command = Some("gen --fast".to_string());
        manager.update_config(config).unwrap();

        let manager2 = ConfigManager::with_path(config_path).unwrap();
        assert_eq!(manager2.config().queue.progress_delay_ms, 5);
        assert_eq!(manager2.config().generation.command.as_deref(), Some("gen --fast"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("partial.toml");
        std::fs::write(&config_path, "[queue]\nprogress_delay_ms = 0\n").unwrap();

        let manager = ConfigManager::with_path(config_path).unwrap();
        assert_eq!(manager.config().queue.progress_delay_ms, 0);
        assert_eq!(manager.config().queue.lookup_retry_delay_ms, 250);
    }

    #[test]
    fn test_layered_load_reads_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("layered.toml");
        std::fs::write(&config_path, "[logging]\nlevel = \"debug\"\n").unwrap();

        let manager = ConfigManager::load_layered(config_path).unwrap();
        assert_eq!(manager.config().logging.level, "debug");
        assert_eq!(manager.config().queue.progress_delay_ms, 100);
    }
}
