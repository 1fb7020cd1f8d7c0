//! Application configuration.
//!
//! Layers YAML files and `HOLON`-prefixed environment variables into a
//! single serde-deserialized [`Config`].

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HOLON_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HOLON";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HOLON_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event-store configuration.
    pub storage: StorageConfig,
    /// Synchronous-facade configuration.
    pub facade: FacadeConfig,
    /// Event-handler runtime configuration.
    pub handler: HandlerConfig,
}

/// Event-store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend type: "sqlite", "memory" or "postgres".
    pub backend: String,
    /// SQLite file path or PostgreSQL connection string.
    pub path: String,
    /// SQLite file path for the roles-tree private projection.
    pub projection_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: "data/holon.db".to_string(),
            projection_path: "data/holon-rolestree.db".to_string(),
        }
    }
}

/// Synchronous-facade configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    /// Hard bound on the completion wait, in seconds.
    pub wait_timeout_secs: u64,
    /// Re-poll tick while waiting, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 10,
            poll_interval_secs: 1,
        }
    }
}

/// Event-handler runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Idle tick between listener pings, in seconds.
    pub ping_interval_secs: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overrides earlier:
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. File given by the `path` argument (if provided)
    /// 3. File named by `HOLON_CONFIG` (if set)
    /// 4. Environment variables prefixed with `HOLON`
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
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

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: in-memory storage, short waits.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig {
                backend: "memory".to_string(),
                path: String::new(),
                projection_path: String::new(),
            },
            facade: FacadeConfig {
                wait_timeout_secs: 5,
                poll_interval_secs: 1,
            },
            handler: HandlerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.storage.backend, "sqlite");
        assert_eq!(config.facade.wait_timeout_secs, 10);
        assert_eq!(config.handler.ping_interval_secs, 10);
    }

    #[test]
    fn for_test_uses_memory_backend() {
        let config = Config::for_test();
        assert_eq!(config.storage.backend, "memory");
    }

    // Config::load reads the process environment and working directory,
    // so keep loads serialized across the test binary.
    #[test]
    #[serial_test::serial]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holon.yaml");
        std::fs::write(
            &path,
            "storage:\n  backend: memory\nfacade:\n  wait_timeout_secs: 3\n",
        )
        .unwrap();

        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.facade.wait_timeout_secs, 3);
        // untouched sections keep their defaults
        assert_eq!(config.handler.ping_interval_secs, 10);
    }
}
