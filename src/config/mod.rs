//! Application configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! `AppConfig`.

mod messaging;

pub use messaging::{AmqpSettings, DEFAULT_INBOUND_QUEUE, DEFAULT_RESULTS_QUEUE};

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ARQUEO_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ARQUEO";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ARQUEO_LOG";

/// Broker host, kept for existing deployments.
pub const RABBITMQ_HOST_ENV_VAR: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_VAR: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_VAR: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASS_ENV_VAR: &str = "RABBITMQ_PASS";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Legacy application driver configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Base URL of the UI-automation bridge.
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8765".to_string(),
            timeout_secs: 60,
        }
    }
}

impl DriverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Operation history configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// SQLite database file.
    pub path: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "arqueos_history.db".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub amqp: AmqpSettings,
    pub driver: DriverConfig,
    pub history: HistoryConfig,
}

impl AppConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `RABBITMQ_*` variables for the broker section
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: AppConfig = config.try_deserialize()?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply the broker variables the previous deployment used.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var(RABBITMQ_HOST_ENV_VAR) {
            self.amqp.host = host;
        }

        if let Ok(port) = std::env::var(RABBITMQ_PORT_ENV_VAR) {
            self.amqp.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: RABBITMQ_PORT_ENV_VAR,
                value: port.clone(),
            })?;
        }

        if let Ok(user) = std::env::var(RABBITMQ_USER_ENV_VAR) {
            self.amqp.user = user;
        }

        if let Ok(password) = std::env::var(RABBITMQ_PASS_ENV_VAR) {
            self.amqp.password = password;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_VARS: [&str; 6] = [
        CONFIG_ENV_VAR,
        RABBITMQ_HOST_ENV_VAR,
        RABBITMQ_PORT_ENV_VAR,
        RABBITMQ_USER_ENV_VAR,
        RABBITMQ_PASS_ENV_VAR,
        "ARQUEO__HISTORY__ENABLED",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.amqp.inbound_queue, "sical_queue.arqueo");
        assert_eq!(config.driver.base_url, "http://127.0.0.1:8765");
        assert_eq!(config.driver.timeout(), Duration::from_secs(60));
        assert!(config.history.enabled);
        assert_eq!(config.history.path, "arqueos_history.db");
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
amqp:
  host: broker.local
  prefetch: 1
driver:
  base_url: http://10.0.0.5:8765
  timeout_secs: 15
history:
  path: /var/lib/arqueo/history.db
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();

        assert_eq!(config.amqp.host, "broker.local");
        assert_eq!(config.amqp.results_queue, "sical_results");
        assert_eq!(config.driver.base_url, "http://10.0.0.5:8765");
        assert_eq!(config.driver.timeout_secs, 15);
        assert_eq!(config.history.path, "/var/lib/arqueo/history.db");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(RABBITMQ_HOST_ENV_VAR, "rabbit");
        std::env::set_var(RABBITMQ_PORT_ENV_VAR, "5673");
        std::env::set_var(RABBITMQ_USER_ENV_VAR, "svc");
        std::env::set_var(RABBITMQ_PASS_ENV_VAR, "pw");
        std::env::set_var("ARQUEO__HISTORY__ENABLED", "false");

        let config = AppConfig::load(None);
        clear_env();
        let config = config.unwrap();

        assert_eq!(config.amqp.host, "rabbit");
        assert_eq!(config.amqp.port, 5673);
        assert_eq!(config.amqp.user, "svc");
        assert_eq!(config.amqp.password, "pw");
        assert!(!config.history.enabled);
    }

    #[test]
    #[serial]
    fn test_invalid_port() {
        clear_env();
        std::env::set_var(RABBITMQ_PORT_ENV_VAR, "not-a-port");

        let result = AppConfig::load(None);
        clear_env();

        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv {
                var: RABBITMQ_PORT_ENV_VAR,
                ..
            })
        ));
    }
}
