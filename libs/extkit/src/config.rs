use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where extensions come from.
///
/// `c2hlbgo` is the legacy sentinel older deployments used for built-in
/// mode; it is accepted as an alias and never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionMode {
    #[default]
    #[serde(alias = "c2hlbgo")]
    Builtin,
    File,
}

fn default_true() -> bool {
    true
}

fn default_load_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_init_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_dependency_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_batch_size() -> usize {
    100
}

fn default_retention() -> usize {
    1000
}

fn default_storage_type() -> String {
    "memory".to_string()
}

fn default_key_prefix() -> String {
    "extd:metrics".to_string()
}

/// The `extension` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionConfig {
    #[serde(default)]
    pub mode: ExtensionMode,
    /// Plugin directory (file mode).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Gates the load/unload/reload admin operations.
    #[serde(default)]
    pub hot_reload: bool,
    /// Plugin ceiling; 0 means unlimited.
    #[serde(default)]
    pub max_plugins: usize,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default = "default_load_timeout", with = "humantime_serde")]
    pub load_timeout: Duration,
    #[serde(default = "default_init_timeout", with = "humantime_serde")]
    pub init_timeout: Duration,
    #[serde(default = "default_dependency_timeout", with = "humantime_serde")]
    pub dependency_timeout: Duration,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            mode: ExtensionMode::default(),
            path: None,
            hot_reload: false,
            max_plugins: 0,
            includes: Vec::new(),
            excludes: Vec::new(),
            load_timeout: default_load_timeout(),
            init_timeout: default_init_timeout(),
            dependency_timeout: default_dependency_timeout(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retention")]
    pub retention: usize,
    #[serde(default)]
    pub storage: MetricsStorageConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval: default_flush_interval(),
            batch_size: default_batch_size(),
            retention: default_retention(),
            storage: MetricsStorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsStorageConfig {
    #[serde(rename = "type", default = "default_storage_type")]
    pub kind: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for MetricsStorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_type(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// The `grpc` configuration section, consumed by the optional-services
/// bring-up. Transport itself belongs to the hub collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grpc_host")]
    pub host: String,
    #[serde(default = "default_grpc_port")]
    pub port: u16,
}

fn default_grpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_grpc_port() -> u16 {
    50051
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_grpc_host(),
            port: default_grpc_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_accepts_legacy_sentinel() {
        let mode: ExtensionMode = serde_yaml::from_str("c2hlbgo").unwrap();
        assert_eq!(mode, ExtensionMode::Builtin);
        let mode: ExtensionMode = serde_yaml::from_str("file").unwrap();
        assert_eq!(mode, ExtensionMode::File);
    }

    #[test]
    fn defaults_are_sane() {
        let cfg: ExtensionConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.mode, ExtensionMode::Builtin);
        assert_eq!(cfg.load_timeout, Duration::from_secs(30));
        assert_eq!(cfg.init_timeout, Duration::from_secs(60));
        assert_eq!(cfg.dependency_timeout, Duration::from_secs(15));
        assert!(cfg.metrics.enabled);
        assert_eq!(cfg.metrics.storage.kind, "memory");
    }

    #[test]
    fn durations_parse_from_strings() {
        let cfg: ExtensionConfig = serde_yaml::from_str(
            r#"
mode: file
path: /opt/extd/plugins
load_timeout: 10s
includes: [auth, billing]
"#,
        )
        .unwrap();
        assert_eq!(cfg.mode, ExtensionMode::File);
        assert_eq!(cfg.load_timeout, Duration::from_secs(10));
        assert_eq!(cfg.includes, vec!["auth", "billing"]);
    }
}
