use convo_core::{ConvoError, PremiumStatus, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod env_substitution;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub entitlement: EntitlementSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// When false, conversation history is kept in memory only.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Grace window between a handler going idle and it being dropped.
    #[serde(default = "default_unload_delay_ms")]
    pub unload_delay_ms: u64,
    /// Period of the stale content association sweep, 0 disables it.
    #[serde(default = "default_association_sweep_secs")]
    pub association_sweep_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementSettings {
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Status reported by the fixed provider used when no real one is wired in.
    #[serde(default)]
    pub status: PremiumStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl ServiceConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConvoError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_yaml::from_str(yaml)
            .map_err(|e| ConvoError::Config(format!("Failed to parse YAML: {}", e)))?;

        // An empty document parses to null
        let mut raw = if raw.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            raw
        };
        env_substitution::expand_tree(&mut raw)?;

        let mut config: ServiceConfig = serde_json::from_value(raw)
            .map_err(|e| ConvoError::Config(format!("Invalid configuration: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var("CONVO_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.storage.enabled && self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConvoError::Config(
                "storage.data_dir cannot be empty while storage is enabled".into(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConvoError::Config("logging.level cannot be empty".into()));
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".convo").join("config.yaml")
    }
}

impl LifecycleSettings {
    pub fn unload_delay(&self) -> Duration {
        Duration::from_millis(self.unload_delay_ms)
    }

    pub fn association_sweep(&self) -> Option<Duration> {
        (self.association_sweep_secs > 0).then(|| Duration::from_secs(self.association_sweep_secs))
    }
}

impl EntitlementSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            unload_delay_ms: default_unload_delay_ms(),
            association_sweep_secs: default_association_sweep_secs(),
        }
    }
}

impl Default for EntitlementSettings {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            status: PremiumStatus::Unknown,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_unload_delay_ms() -> u64 { 50 }
fn default_association_sweep_secs() -> u64 { 300 }
fn default_max_age_secs() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_data_dir() -> PathBuf {
    home_dir().join(".convo").join("conversations")
}
