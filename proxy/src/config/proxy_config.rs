use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// TOML file holding the `[[users]]` policy records
    pub users_path: String,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log directory for file-based logging, stdout when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// How often live user credit is written back to the user manager
    #[serde(default = "default_status_sync_interval_secs")]
    pub status_sync_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "proxy.log".to_string()
}

fn default_status_sync_interval_secs() -> u64 {
    60
}

impl ProxyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ProxyConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.users_path.trim().is_empty() {
            return Err(ProxyError::Configuration(
                "users_path must not be empty".to_string(),
            ));
        }
        if self.status_sync_interval_secs == 0 {
            return Err(ProxyError::Configuration(
                "status_sync_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
