//! Configuration management for Flowguard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FlowguardError, Result};
use crate::ratelimit::RateSpec;
use crate::store::MemoryStoreConfig;

/// Main configuration for Flowguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowguardConfig {
    /// Guarded call behaviour
    #[serde(default)]
    pub guard: GuardConfig,

    /// In-memory store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named limiter declarations
    #[serde(default)]
    pub limiters: HashMap<String, RateSpec>,
}

/// What to do when a granted guarded operation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Run the operation one more time and return that attempt's result.
    #[default]
    RetryOnce,
    /// Return the first failure.
    Propagate,
}

/// Guarded call configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Client identifier; generated when absent
    #[serde(default)]
    pub client_id: Option<String>,

    /// Longest a blocking acquisition waits before timing out, in milliseconds
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
}

impl StoreConfig {
    /// Build the memory store client configuration.
    pub fn memory_store_config(&self) -> MemoryStoreConfig {
        let mut config = MemoryStoreConfig::default();
        if let Some(client_id) = &self.client_id {
            config.client_id = client_id.clone();
        }
        config.response_timeout = self.response_timeout_ms.map(Duration::from_millis);
        config
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FlowguardConfig {
    /// Load configuration from a file, with `FLOWGUARD__*` environment
    /// variables layered on top (e.g. `FLOWGUARD__GUARD__RETRY_POLICY`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading flowguard configuration");

        if !path.exists() {
            return Err(FlowguardError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }

        let config: FlowguardConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("FLOWGUARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FlowguardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FlowguardError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every limiter declaration.
    pub fn validate(&self) -> Result<()> {
        for (name, spec) in &self.limiters {
            spec.validate()
                .map_err(|e| FlowguardError::Config(format!("limiter {}: {}", name, e)))?;
        }
        Ok(())
    }

    /// Get a declared limiter. A declaration without its own name is named
    /// after its key.
    pub fn limiter(&self, name: &str) -> Option<RateSpec> {
        let mut spec = self.limiters.get(name)?.clone();
        if spec.name.trim().is_empty() {
            spec.name = name.to_string();
        }
        Some(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Scope, TimeUnit};

    #[test]
    fn test_defaults() {
        let config = FlowguardConfig::default();
        assert_eq!(config.guard.retry_policy, RetryPolicy::RetryOnce);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.limiters.is_empty());
        assert_eq!(config.store.memory_store_config().response_timeout, None);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r##"
guard:
  retry_policy: propagate
store:
  client_id: node-a
  response_timeout_ms: 500
logging:
  level: debug
  json: true
limiters:
  orders:
    rate: 10
    interval: 1
    interval_unit: minutes
    fallback: on_limited
  per_user:
    name: "user:"
    args: ["#p0.user_id"]
    rate: 1
    scope: per_instance
"##;
        let config = FlowguardConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.guard.retry_policy, RetryPolicy::Propagate);
        let store = config.store.memory_store_config();
        assert_eq!(store.client_id, "node-a");
        assert_eq!(store.response_timeout, Some(Duration::from_millis(500)));
        assert!(config.logging.json);

        let orders = config.limiter("orders").unwrap();
        assert_eq!(orders.name, "orders");
        assert_eq!(orders.interval_unit, TimeUnit::Minutes);
        assert_eq!(orders.fallback, "on_limited");

        let per_user = config.limiter("per_user").unwrap();
        assert_eq!(per_user.name, "user:");
        assert_eq!(per_user.scope, Scope::PerInstance);

        assert!(config.limiter("missing").is_none());
    }

    #[test]
    fn test_invalid_limiter_rejected() {
        let yaml = r#"
limiters:
  broken:
    rate: 0
"#;
        let err = FlowguardConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_missing_file() {
        let err = FlowguardConfig::from_file("/nonexistent/flowguard.yaml").unwrap_err();
        assert!(matches!(err, FlowguardError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("flowguard-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "limiters:\n  orders:\n    rate: 3\n    timeout: 0\n",
        )
        .unwrap();

        let config = FlowguardConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let orders = config.limiter("orders").unwrap();
        assert_eq!(orders.rate, 3);
        assert_eq!(orders.timeout, 0);
    }
}
