//! Gateway Configuration
//!
//! One TOML file describing the device, store, orchestrator, webhook
//! dispatcher, and provider presets, with `GATEWAY_*` environment
//! overrides on top. Every field has a default; an absent file yields a
//! runnable local configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::provider::ProviderPreset;
use crate::store::StoreConfig;
use crate::webhook::WebhookConfig;

/// Top-level gateway configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Tracing filter directive
    pub log_filter: LogSection,
    /// Accelerator section
    pub device: DeviceSection,
    /// Task store section
    pub store: StoreSection,
    /// Orchestrator section
    pub orchestrator: OrchestratorSection,
    /// Webhook dispatcher section
    pub webhook: WebhookSection,
    /// Provider presets, `[[providers]]` tables
    pub providers: Vec<ProviderPreset>,
}

/// Logging defaults.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct LogSection(
    /// Filter directive string, e.g. `info` or `gateway_core=debug`
    pub String,
);

impl Default for LogSection {
    fn default() -> Self {
        Self("info".to_string())
    }
}

/// `[device]` table.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Accelerator index
    pub device_index: u32,
    /// Device memory capacity reported by the fixed monitor, MB
    pub total_memory_mb: u64,
    /// Usage ceiling, percent of total
    pub max_usage_percent: u8,
    /// Memory held back from admission, MB
    pub reserve_mb: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            device_index: 0,
            total_memory_mb: 24_576,
            max_usage_percent: 95,
            reserve_mb: 1024,
        }
    }
}

/// `[store]` table.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSection {
    /// Terminal task retention, seconds
    pub task_ttl_secs: u64,
    /// Idempotency mapping retention, seconds
    pub idempotency_ttl_secs: u64,
    /// Dispatch queue capacity
    pub queue_max_size: usize,
    /// Status event channel capacity
    pub event_capacity: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            task_ttl_secs: 86_400,
            idempotency_ttl_secs: 86_400,
            queue_max_size: 1000,
            event_capacity: 256,
        }
    }
}

/// `[orchestrator]` table.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Accelerator lease wait budget, seconds
    pub lease_wait_secs: u64,
    /// Provider call attempts per task
    pub max_attempts: u32,
    /// Delay between transient retries, seconds
    pub retry_delay_secs: u64,
    /// Idle poll fallback, milliseconds
    pub idle_poll_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            lease_wait_secs: 30,
            max_attempts: 3,
            retry_delay_secs: 1,
            idle_poll_ms: 500,
        }
    }
}

/// `[webhook]` table.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookSection {
    /// Delivery worker count
    pub workers: usize,
    /// Pending-delivery queue capacity
    pub queue_capacity: usize,
    /// Attempts per delivery
    pub max_attempts: u32,
    /// Delay before the first retry, seconds
    pub base_delay_secs: u64,
    /// Per-attempt timeout, seconds
    pub request_timeout_secs: u64,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            max_attempts: 3,
            base_delay_secs: 1,
            request_timeout_secs: 30,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config at {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range
    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::error::Error {
    fn from(err: ConfigError) -> Self {
        Self::Internal(format!("configuration: {err}"))
    }
}

impl GatewayConfig {
    /// Conventional config path (`<config dir>/gateway/gateway.toml`)
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gateway").join("gateway.toml"))
    }

    /// Load from `path`, or fall back to defaults when the file does not
    /// exist. Environment overrides always apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => Self::default(),
        };
        config.apply_env();
        config.check()?;
        Ok(config)
    }

    /// Apply `GATEWAY_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(filter) = std::env::var("GATEWAY_LOG") {
            self.log_filter = LogSection(filter);
        }
        env_override("GATEWAY_QUEUE_MAX_SIZE", &mut self.store.queue_max_size);
        env_override("GATEWAY_TASK_TTL_SECS", &mut self.store.task_ttl_secs);
        env_override(
            "GATEWAY_IDEMPOTENCY_TTL_SECS",
            &mut self.store.idempotency_ttl_secs,
        );
        env_override(
            "GATEWAY_MAX_USAGE_PERCENT",
            &mut self.device.max_usage_percent,
        );
        env_override("GATEWAY_RESERVE_MB", &mut self.device.reserve_mb);
        env_override("GATEWAY_TOTAL_MEMORY_MB", &mut self.device.total_memory_mb);
        env_override(
            "GATEWAY_LEASE_WAIT_SECS",
            &mut self.orchestrator.lease_wait_secs,
        );
        env_override(
            "GATEWAY_WEBHOOK_TIMEOUT_SECS",
            &mut self.webhook.request_timeout_secs,
        );
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.device.max_usage_percent > 100 {
            return Err(ConfigError::Invalid(format!(
                "device.max_usage_percent must be <= 100, got {}",
                self.device.max_usage_percent
            )));
        }
        if self.store.queue_max_size == 0 {
            return Err(ConfigError::Invalid(
                "store.queue_max_size must be positive".into(),
            ));
        }
        if self.orchestrator.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Runtime store configuration
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            task_ttl: Duration::from_secs(self.store.task_ttl_secs),
            idempotency_ttl: Duration::from_secs(self.store.idempotency_ttl_secs),
            queue_max_size: self.store.queue_max_size,
            event_capacity: self.store.event_capacity,
        }
    }

    /// Runtime device configuration
    #[must_use]
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            device_index: self.device.device_index,
            max_usage_percent: self.device.max_usage_percent,
            reserve_mb: self.device.reserve_mb,
        }
    }

    /// Runtime orchestrator configuration
    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            lease_wait: Duration::from_secs(self.orchestrator.lease_wait_secs),
            max_attempts: self.orchestrator.max_attempts,
            retry_delay: Duration::from_secs(self.orchestrator.retry_delay_secs),
            idle_poll: Duration::from_millis(self.orchestrator.idle_poll_ms),
        }
    }

    /// Runtime webhook configuration
    #[must_use]
    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            workers: self.webhook.workers,
            queue_capacity: self.webhook.queue_capacity,
            max_attempts: self.webhook.max_attempts,
            base_delay: Duration::from_secs(self.webhook.base_delay_secs),
            request_timeout: Duration::from_secs(self.webhook.request_timeout_secs),
        }
    }
}

fn env_override<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(var, value = %raw, "ignoring unparsable env override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;

    #[test]
    fn test_defaults_are_runnable() {
        let config = GatewayConfig::default();
        assert_eq!(config.device.max_usage_percent, 95);
        assert_eq!(config.device.reserve_mb, 1024);
        assert_eq!(config.store.queue_max_size, 1000);
        assert_eq!(config.store.task_ttl_secs, 86_400);
        assert_eq!(config.webhook.request_timeout_secs, 30);
        config.check().unwrap();
    }

    #[test]
    fn test_parse_full_file() {
        let raw = r#"
            log_filter = "debug"

            [device]
            total_memory_mb = 16384
            max_usage_percent = 90

            [store]
            queue_max_size = 50

            [[providers]]
            name = "ollama"
            kind = "local"
            models = ["llama-7b"]
            footprint_mb = 6000

            [[providers]]
            name = "openai"
            kind = "remote_api"
            base_url = "https://api.openai.com/v1"
        "#;
        let config: GatewayConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.log_filter.0, "debug");
        assert_eq!(config.device.total_memory_mb, 16_384);
        assert_eq!(config.store.queue_max_size, 50);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].kind, ProviderKind::Local);
        assert_eq!(config.providers[0].footprint_mb, Some(6000));
        // Unset sections keep defaults.
        assert_eq!(config.orchestrator.max_attempts, 3);
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.store.queue_max_size, 1000);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[device]\nmax_usage_percent = 150\n").unwrap();
        let err = GatewayConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_env_override_applies() {
        std::env::set_var("GATEWAY_RESERVE_MB", "2048");
        let mut config = GatewayConfig::default();
        config.apply_env();
        std::env::remove_var("GATEWAY_RESERVE_MB");
        assert_eq!(config.device.reserve_mb, 2048);
    }

    #[test]
    fn test_runtime_conversions() {
        let config = GatewayConfig::default();
        assert_eq!(config.store_config().task_ttl, Duration::from_secs(86_400));
        assert_eq!(
            config.orchestrator_config().idle_poll,
            Duration::from_millis(500)
        );
        assert_eq!(
            config.webhook_config().base_delay,
            Duration::from_secs(1)
        );
    }
}
