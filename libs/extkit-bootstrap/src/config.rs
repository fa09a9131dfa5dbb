use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use extkit::config::{ExtensionConfig, GrpcConfig};
use extkit_db::DatabaseConfig;

/// Main application configuration: strongly-typed global sections plus a
/// flexible per-extension configuration bag.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub extension: ExtensionConfig,
    #[serde(default)]
    pub data: Option<DataConfig>,
    #[serde(default)]
    pub consul: Option<ConsulConfig>,
    #[serde(default)]
    pub grpc: GrpcConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    /// Per-extension bag: extension name -> arbitrary JSON/YAML value.
    #[serde(default)]
    pub extensions: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DataConfig {
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub addr: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default, with = "humantime_serde")]
    pub read_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub write_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub dial_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsulConfig {
    pub address: String,
    #[serde(default = "default_consul_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub discovery: ConsulDiscoveryConfig,
}

fn default_consul_scheme() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsulDiscoveryConfig {
    #[serde(default)]
    pub health_check: bool,
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ConsulDiscoveryConfig {
    fn default() -> Self {
        Self {
            health_check: false,
            check_interval: default_check_interval(),
            timeout: default_check_timeout(),
        }
    }
}

/// Logging configuration: subsystem name -> settings. Key "default" is the
/// catch-all.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/extd.log".to_string(),
            file_level: "debug".to_string(),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl AppConfig {
    /// Layered loading: defaults -> YAML file -> environment variables.
    /// `EXTD__EXTENSION__MODE=file` maps to `extension.mode`.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(config_path.as_ref()))
            .merge(Env::prefixed("EXTD__").split("__"));

        figment
            .extract()
            .with_context(|| "Failed to extract config from figment".to_string())
    }

    /// Like [`AppConfig::load_layered`], but environment-only when no file
    /// is given.
    pub fn load_or_default(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(p) => Self::load_layered(p),
            None => {
                use figment::{
                    providers::{Env, Serialized},
                    Figment,
                };
                Figment::new()
                    .merge(Serialized::defaults(AppConfig::default()))
                    .merge(Env::prefixed("EXTD__").split("__"))
                    .extract()
                    .with_context(|| "Failed to extract config from environment".to_string())
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }
}
