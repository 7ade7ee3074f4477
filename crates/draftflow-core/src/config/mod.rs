mod database;
mod engine;
mod queue;

pub use database::DatabaseConfig;
pub use engine::{EngineConfig, GenerationConfig, NotifierConfig};
pub use queue::QueueConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DraftflowError, Result};

/// Root configuration loaded from draftflow.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftflowConfig {
    /// Database settings.
    pub database: DatabaseConfig,

    /// Outbound queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Draft generation settings.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Workflow engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Notification transport settings.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DraftflowConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DraftflowError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| DraftflowError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration for the given database URL.
    pub fn default_with_database_url(url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            },
            queue: QueueConfig::default(),
            generation: GenerationConfig::default(),
            engine: EngineConfig::default(),
            notifier: NotifierConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(DraftflowError::Config("database.url is required".into()));
        }
        if self.queue.max_attempts == 0 || self.engine.notification_max_attempts == 0 {
            return Err(DraftflowError::Config(
                "message max_attempts must be at least 1".into(),
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(DraftflowError::Config(
                "queue.batch_size must be at least 1".into(),
            ));
        }
        if self.queue.backoff_cap_secs < self.queue.backoff_base_secs {
            return Err(DraftflowError::Config(
                "queue.backoff_cap_secs must not be below backoff_base_secs".into(),
            ));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| DraftflowError::Internal(e.to_string()))?;

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    Ok(result)
}
