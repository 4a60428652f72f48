//! Service configuration.
//!
//! [`CaptureConfig`] groups the per-component configs. It is read from YAML and
//! then overridden by `CAPTURE_*` environment variables:
//!
//! | Variable                      | Field                                  |
//! |-------------------------------|----------------------------------------|
//! | `CAPTURE_DEBOUNCE_MS`         | `collector.debounce_window`            |
//! | `CAPTURE_MAX_BATCH_SIZE`      | `collector.max_batch_size`             |
//! | `CAPTURE_MAX_SESSION_AGE_MS`  | `collector.max_session_age`            |
//! | `CAPTURE_CONCURRENCY`         | `processor.concurrency_limit`          |
//! | `CAPTURE_ITEM_TIMEOUT_MS`     | `processor.per_item_timeout`           |
//! | `CAPTURE_BATCH_TIMEOUT_MS`    | `processor.batch_timeout`              |
//! | `CAPTURE_FALLBACK_ENABLED`    | `processor.fallback_enabled`           |
//! | `CAPTURE_POOL_MAX_HANDLES`    | `pool.max_handles`                     |
//! | `CAPTURE_MAX_RETRIES`         | `retry.max_retries`                    |
//!
//! ```yaml
//! collector:
//!   debounce_window_ms: 5000
//!   max_batch_size: 20
//! processor:
//!   concurrency_limit: 8
//!   fallback_enabled: true
//! ```

use crate::batch::{CollectorConfig, ProcessorConfig};
use crate::pool::PoolConfig;
use crate::report::ReportConfig;
use crate::resilience::retry::RetryConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub collector: CollectorConfig,
    pub processor: ProcessorConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub report: ReportConfig,
}

impl CaptureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let cfg: CaptureConfig = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Load from an optional file, then apply `CAPTURE_*` overrides from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_yaml_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from an arbitrary lookup (the process environment in production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CAPTURE_DEBOUNCE_MS")? {
            self.collector.debounce_window = std::time::Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "CAPTURE_MAX_BATCH_SIZE")? {
            self.collector.max_batch_size = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CAPTURE_MAX_SESSION_AGE_MS")? {
            self.collector.max_session_age = std::time::Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "CAPTURE_CONCURRENCY")? {
            self.processor.concurrency_limit = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CAPTURE_ITEM_TIMEOUT_MS")? {
            self.processor.per_item_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CAPTURE_BATCH_TIMEOUT_MS")? {
            self.processor.batch_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(b) = parse_var::<bool, _>(&lookup, "CAPTURE_FALLBACK_ENABLED")? {
            self.processor.fallback_enabled = b;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "CAPTURE_POOL_MAX_HANDLES")? {
            self.pool.max_handles = n;
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "CAPTURE_MAX_RETRIES")? {
            self.retry.max_retries = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new()
                    .with_source("config")
                    .with_details(field.to_string()),
            ))
        };
        if self.collector.max_batch_size == 0 {
            return fail("collector.max_batch_size", "max batch size must be at least 1");
        }
        if self.collector.debounce_window.is_zero() {
            return fail("collector.debounce_window_ms", "debounce window must be positive");
        }
        if self.collector.max_session_age < self.collector.debounce_window {
            return fail(
                "collector.max_session_age_ms",
                "max session age must not be shorter than the debounce window",
            );
        }
        if self.processor.concurrency_limit == 0 {
            return fail("processor.concurrency_limit", "concurrency limit must be at least 1");
        }
        if self.processor.per_item_timeout.is_zero() || self.processor.batch_timeout.is_zero() {
            return fail("processor.*_timeout_ms", "timeouts must be positive");
        }
        if self.pool.max_handles == 0 {
            return fail("pool.max_handles", "pool must allow at least one handle");
        }
        if self.retry.max_delay < self.retry.min_delay {
            return fail("retry.max_delay_ms", "max delay must not be below min delay");
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::configuration_with_context(
                format!("cannot parse {key}={raw:?}"),
                ErrorContext::new().with_source("config_env"),
            )
        }),
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = CaptureConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.collector.debounce_window, Duration::from_secs(5));
        assert_eq!(cfg.collector.max_batch_size, 20);
        assert_eq!(cfg.processor.concurrency_limit, 8);
        assert!(cfg.processor.fallback_enabled);
    }

    #[test]
    fn test_yaml_partial_override() {
        let cfg = CaptureConfig::from_yaml_str(
            r#"
collector:
  debounce_window_ms: 1000
  max_batch_size: 5
processor:
  concurrency_limit: 2
  fallback_enabled: false
"#,
        )
        .unwrap();
        assert_eq!(cfg.collector.debounce_window, Duration::from_secs(1));
        assert_eq!(cfg.collector.max_batch_size, 5);
        // untouched fields keep defaults
        assert_eq!(cfg.collector.max_session_age, Duration::from_secs(600));
        assert_eq!(cfg.processor.concurrency_limit, 2);
        assert!(!cfg.processor.fallback_enabled);
    }

    #[test]
    fn test_yaml_rejects_invalid_values() {
        let err = CaptureConfig::from_yaml_str("collector:\n  max_batch_size: 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CAPTURE_DEBOUNCE_MS", "250"),
            ("CAPTURE_CONCURRENCY", "3"),
            ("CAPTURE_FALLBACK_ENABLED", "false"),
        ]
        .into_iter()
        .collect();
        let mut cfg = CaptureConfig::default();
        cfg.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.collector.debounce_window, Duration::from_millis(250));
        assert_eq!(cfg.processor.concurrency_limit, 3);
        assert!(!cfg.processor.fallback_enabled);
    }

    #[test]
    fn test_env_override_parse_error() {
        let mut cfg = CaptureConfig::default();
        let err = cfg
            .apply_env_overrides(|k| (k == "CAPTURE_MAX_BATCH_SIZE").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CAPTURE_MAX_BATCH_SIZE"));
    }
}
