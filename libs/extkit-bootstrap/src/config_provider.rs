use std::sync::Arc;

use crate::config::AppConfig;

/// Configuration provider seam for embedders: hands extensions their
/// config sections without exposing the whole app config.
pub trait ConfigProvider: Send + Sync {
    /// Config bag for a specific extension.
    fn get_extension_config(&self, extension_name: &str) -> Option<&serde_json::Value>;

    /// A top-level section by key.
    fn get_config_raw(&self, key: &str) -> Option<serde_json::Value>;
}

pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn from_arc(config: Arc<AppConfig>) -> Self {
        Self(config)
    }

    pub fn inner(&self) -> &AppConfig {
        &self.0
    }
}

impl ConfigProvider for AppConfigProvider {
    fn get_extension_config(&self, extension_name: &str) -> Option<&serde_json::Value> {
        self.0.extensions.get(extension_name)
    }

    fn get_config_raw(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "extension" => serde_json::to_value(&self.0.extension).ok(),
            "grpc" => serde_json::to_value(&self.0.grpc).ok(),
            "data" => self
                .0
                .data
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            "consul" => self
                .0
                .consul
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            "logging" => self
                .0
                .logging
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_bags_resolve_by_name() {
        let mut config = AppConfig::default();
        config.extensions.insert(
            "audit".to_string(),
            serde_json::json!({"sample_rate": 0.5}),
        );
        let provider = AppConfigProvider::new(config);

        assert!(provider.get_extension_config("audit").is_some());
        assert!(provider.get_extension_config("missing").is_none());
        assert!(provider.get_config_raw("extension").is_some());
        assert!(provider.get_config_raw("nope").is_none());
    }
}
