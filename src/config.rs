use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::session::SessionSettings;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database URL. Without it the relay serves lock status from memory.
    pub db_url: Option<String>,

    /// Base URL of the user service resolving lock holders
    pub user_directory_url: Option<String>,

    /// Name this service presents in service tokens
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Secret signing service tokens for the user service
    pub service_jwt_secret: Option<String>,

    // Session timing
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_autosave_debounce_ms")]
    pub autosave_debounce_ms: u64,
    #[serde(default = "default_broadcast_coalesce_ms")]
    pub broadcast_coalesce_ms: u64,

    /// Per-document buffer of undelivered broadcast messages
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Locks older than this count as free on acquire. Unset disables expiry.
    pub stale_lock_after_secs: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    /// Default tracing filter: our crates at `log_level`, everything else at info.
    pub fn log_filter(&self) -> String {
        format!(
            "script_collab={level},tower_http={level},info",
            level = self.log_level
        )
    }

    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Timing of editor sessions hosted by this process
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            autosave_debounce: Duration::from_millis(self.autosave_debounce_ms),
            broadcast_coalesce: Duration::from_millis(self.broadcast_coalesce_ms),
            stale_lock_after: self.stale_lock_after_secs.map(Duration::from_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            db_url: None,
            user_directory_url: None,
            service_name: default_service_name(),
            service_jwt_secret: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            autosave_debounce_ms: default_autosave_debounce_ms(),
            broadcast_coalesce_ms: default_broadcast_coalesce_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            stale_lock_after_secs: None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "script-collab".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_autosave_debounce_ms() -> u64 {
    1500
}

fn default_broadcast_coalesce_ms() -> u64 {
    50
}

fn default_broadcast_capacity() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_session_defaults() {
        let config = Config::default();
        assert_eq!(config.settings(), SessionSettings::default());
        assert_eq!(config.server_address(), "0.0.0.0:3000");
        assert!(config.is_development());
    }

    #[test]
    fn stale_lock_expiry_is_opt_in() {
        let mut config = Config::default();
        assert_eq!(config.settings().stale_lock_after, None);

        config.stale_lock_after_secs = Some(300);
        assert_eq!(
            config.settings().stale_lock_after,
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn log_level_drives_the_default_filter() {
        let mut config = Config::default();
        assert_eq!(config.log_filter(), "script_collab=info,tower_http=info,info");

        config.log_level = "trace".into();
        assert!(config.log_filter().starts_with("script_collab=trace,"));
    }
}
