//! Service configuration
//!
//! Loaded from a TOML file, then overridden by environment variables:
//!
//! - `QM_CACHE_SHARDS`, `QM_CACHE_EXECUTE_TIMEOUT_MS`
//! - `QM_ACK_ENABLED`, `QM_ACK_TIMEOUT_MS`, `QM_FAIL_TIMEOUT_MS`,
//!   `QM_MAX_ATTEMPTS`, `QM_BACKOFF_MS`
//! - `QM_MAX_FIELD_VALUE_LENGTH`
//! - `QM_REPORTING_ENABLED`, `QM_REPORTING_INTERVAL_MS`
//! - `QM_LOG_LEVEL`, `QM_LOG_JSON`
//!
//! Durations are written as milliseconds (`*_ms` keys).

use crate::error::MetricError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    pub delivery: DeliveryConfig,
    pub store: StoreConfig,
    pub reporting: ReportingConfig,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Configuration for tests (short timeouts, few shards)
    pub fn test() -> Self {
        ServiceConfig {
            cache: CacheConfig::test(),
            delivery: DeliveryConfig::test(),
            store: StoreConfig::default(),
            reporting: ReportingConfig::test(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, MetricError> {
        let config: ServiceConfig =
            toml::from_str(s).map_err(|e| MetricError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (or defaults when `None`), apply env overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, MetricError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    MetricError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                toml::from_str(&text).map_err(|e| MetricError::Config(e.to_string()))?
            }
            None => ServiceConfig::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `QM_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), MetricError> {
        if let Some(v) = env_parse("QM_CACHE_SHARDS")? {
            self.cache.num_shards = v;
        }
        if let Some(v) = env_parse("QM_CACHE_EXECUTE_TIMEOUT_MS")? {
            self.cache.execute_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_bool("QM_ACK_ENABLED") {
            self.delivery.ack_enabled = v;
        }
        if let Some(v) = env_parse("QM_ACK_TIMEOUT_MS")? {
            self.delivery.ack_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("QM_FAIL_TIMEOUT_MS")? {
            self.delivery.fail_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("QM_MAX_ATTEMPTS")? {
            self.delivery.max_attempts = v;
        }
        if let Some(v) = env_parse("QM_BACKOFF_MS")? {
            self.delivery.backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("QM_MAX_FIELD_VALUE_LENGTH")? {
            self.store.max_field_value_length = v;
        }
        if let Some(v) = env_bool("QM_REPORTING_ENABLED") {
            self.reporting.enabled = v;
        }
        if let Some(v) = env_parse("QM_REPORTING_INTERVAL_MS")? {
            self.reporting.interval = Duration::from_millis(v);
        }
        if let Ok(level) = std::env::var("QM_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = env_bool("QM_LOG_JSON") {
            self.logging.json = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), MetricError> {
        let invalid = |msg: &str| Err(MetricError::Config(msg.to_string()));
        if self.cache.num_shards == 0 {
            return invalid("cache.num_shards must be at least 1");
        }
        if self.cache.execute_timeout.is_zero() {
            return invalid("cache.execute_timeout_ms must be positive");
        }
        if self.delivery.max_attempts == 0 {
            return invalid("delivery.max_attempts must be at least 1");
        }
        if self.delivery.ack_timeout.is_zero() || self.delivery.fail_timeout.is_zero() {
            return invalid("delivery timeouts must be positive");
        }
        if self.store.max_field_value_length == 0 {
            return invalid("store.max_field_value_length must be positive");
        }
        if self.reporting.enabled && self.reporting.interval.is_zero() {
            return invalid("reporting.interval_ms must be positive");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, MetricError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MetricError::Config(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "true" || v == "1")
}

/// Distributed cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of cache shards (default: 16)
    pub num_shards: usize,
    /// Bound on one per-key execution (default: 5s)
    #[serde(with = "duration_millis", rename = "execute_timeout_ms")]
    pub execute_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            num_shards: 16,
            execute_timeout: Duration::from_millis(5_000),
        }
    }
}

impl CacheConfig {
    pub fn test() -> Self {
        CacheConfig {
            num_shards: 4,
            execute_timeout: Duration::from_millis(1_000),
        }
    }
}

/// Delivery coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Wait for delivery confirmations (default: true)
    pub ack_enabled: bool,
    /// Wait per attempt for a confirmation (default: 500ms)
    #[serde(with = "duration_millis", rename = "ack_timeout_ms")]
    pub ack_timeout: Duration,
    /// Give up once this much time has passed since the first attempt (default: 60s)
    #[serde(with = "duration_millis", rename = "fail_timeout_ms")]
    pub fail_timeout: Duration,
    /// Attempts per submission (default: 10)
    pub max_attempts: u32,
    /// Sleep between attempts (default: 200ms)
    #[serde(with = "duration_millis", rename = "backoff_ms")]
    pub backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            ack_enabled: true,
            ack_timeout: Duration::from_millis(500),
            fail_timeout: Duration::from_millis(60_000),
            max_attempts: 10,
            backoff: Duration::from_millis(200),
        }
    }
}

impl DeliveryConfig {
    pub fn test() -> Self {
        DeliveryConfig {
            ack_enabled: true,
            ack_timeout: Duration::from_millis(100),
            fail_timeout: Duration::from_millis(2_000),
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Column store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Longest stored field value before truncation (default: 500000 chars)
    pub max_field_value_length: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_field_value_length: 500_000,
        }
    }
}

/// Periodic statistics reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub enabled: bool,
    #[serde(with = "duration_millis", rename = "interval_ms")]
    pub interval: Duration,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        ReportingConfig {
            enabled: true,
            interval: Duration::from_millis(60_000),
        }
    }
}

impl ReportingConfig {
    pub fn test() -> Self {
        ReportingConfig {
            enabled: false,
            interval: Duration::from_millis(50),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // TOML integers are i64
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert!(config.delivery.ack_enabled);
        assert_eq!(config.delivery.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.delivery.fail_timeout, Duration::from_secs(60));
        assert_eq!(config.delivery.max_attempts, 10);
        assert_eq!(config.delivery.backoff, Duration::from_millis(200));
        assert_eq!(config.cache.num_shards, 16);
        assert_eq!(config.store.max_field_value_length, 500_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ServiceConfig::from_toml_str(
            r#"
            [delivery]
            ack_timeout_ms = 250
            max_attempts = 4

            [cache]
            num_shards = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.delivery.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.delivery.max_attempts, 4);
        assert_eq!(config.delivery.backoff, Duration::from_millis(200));
        assert_eq!(config.cache.num_shards, 2);
    }

    #[test]
    fn test_toml_serialization() {
        let config = ServiceConfig::test();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("ack_timeout_ms = 100"));
        assert_eq!(ServiceConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let err = ServiceConfig::from_toml_str("[delivery]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, MetricError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\nmax_field_value_length = 1024").unwrap();
        let config = ServiceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.store.max_field_value_length, 1024);

        let missing = ServiceConfig::load(Some(Path::new("/nonexistent/qm.toml")));
        assert!(matches!(missing, Err(MetricError::Config(_))));
    }
}
