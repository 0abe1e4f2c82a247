//! Host configuration, read from a JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use conductor_core::RetryPolicy;
use conductor_observability::LogConfig;
use conductor_pipeline::{FailurePolicy, PipelineOptions};

/// Environment variable holding the config file path.
pub const CONFIG_ENV: &str = "CONDUCTOR_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration. Every field has a default; durations are in seconds.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub log: LogConfig,
    /// Lease expiry for the in-memory backend. `None` never expires.
    pub lease_ttl_secs: Option<u64>,
    /// Static feature flags; unknown flags are disabled.
    pub feature_flags: BTreeMap<String, bool>,
    pub catalog: CatalogConfig,
    pub heartbeat: HeartbeatConfig,
}

/// Recurring catalog sync job group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub interval_secs: u64,
    pub lease: String,
    pub lease_refresh_secs: u64,
    pub feature_flag: Option<String>,
    /// Items fetched per cycle.
    pub page_size: u32,
    pub pipeline: PipelineConfig,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            lease: "catalog-sync".to_string(),
            lease_refresh_secs: 15,
            feature_flag: None,
            page_size: 50,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl CatalogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lease_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.lease_refresh_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub capacity: usize,
    pub failure_policy: FailurePolicy,
    /// Total attempts per item, including the first.
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            failure_policy: FailurePolicy::DropAndLog,
            retry_attempts: 1,
            retry_delay_secs: 1,
        }
    }
}

impl PipelineConfig {
    pub fn options(&self) -> PipelineOptions {
        let retry = if self.retry_attempts > 1 {
            RetryPolicy::fixed(self.retry_attempts, Duration::from_secs(self.retry_delay_secs))
        } else {
            RetryPolicy::no_retry()
        };
        PipelineOptions::default()
            .with_capacity(self.capacity)
            .with_failure_policy(self.failure_policy)
            .with_retry(retry)
    }
}

/// Heartbeat pipeline group run by the pipeline host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Delay between runs; `None` runs once.
    pub interval_secs: Option<u64>,
    pub lease: Option<String>,
    pub lease_refresh_secs: u64,
    pub feature_flag: Option<String>,
    /// Beats emitted per run, one per second.
    pub beats: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: Some(30),
            lease: Some("heartbeat".to_string()),
            lease_refresh_secs: 15,
            feature_flag: None,
            beats: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn lease_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.lease_refresh_secs)
    }
}

impl HostConfig {
    /// Load from the file named by `CONDUCTOR_CONFIG`, or defaults when unset.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl_secs == Some(0) {
            return Err(ConfigError::Invalid("lease_ttl_secs must be positive".into()));
        }
        if let Some(ttl) = self.lease_ttl_secs {
            if self.catalog.lease_refresh_secs >= ttl {
                return Err(ConfigError::Invalid(
                    "catalog.lease_refresh_secs must be shorter than lease_ttl_secs".into(),
                ));
            }
            if self.heartbeat.lease.is_some() && self.heartbeat.lease_refresh_secs >= ttl {
                return Err(ConfigError::Invalid(
                    "heartbeat.lease_refresh_secs must be shorter than lease_ttl_secs".into(),
                ));
            }
        }
        if self.catalog.interval_secs == 0 || self.catalog.lease_refresh_secs == 0 {
            return Err(ConfigError::Invalid("catalog intervals must be positive".into()));
        }
        if self.catalog.pipeline.capacity == 0 {
            return Err(ConfigError::Invalid("catalog.pipeline.capacity must be positive".into()));
        }
        if self.catalog.pipeline.retry_attempts == 0 {
            return Err(ConfigError::Invalid("catalog.pipeline.retry_attempts must be at least 1".into()));
        }
        if self.heartbeat.interval_secs == Some(0) || self.heartbeat.lease_refresh_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat intervals must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = HostConfig::from_json("{}").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.catalog.interval(), Duration::from_secs(300));
        assert_eq!(config.heartbeat.interval_secs, Some(30));
    }

    #[test]
    fn nested_fields_override_defaults() {
        let config = HostConfig::from_json(
            r#"{
                "lease_ttl_secs": 60,
                "feature_flags": { "catalog": true },
                "catalog": {
                    "interval_secs": 10,
                    "feature_flag": "catalog",
                    "pipeline": { "failure_policy": "dead_letter", "retry_attempts": 3 }
                },
                "heartbeat": { "interval_secs": null, "lease": null }
            }"#,
        )
        .unwrap();

        assert_eq!(config.lease_ttl_secs, Some(60));
        assert_eq!(config.feature_flags.get("catalog"), Some(&true));
        assert_eq!(config.catalog.interval_secs, 10);
        assert_eq!(config.catalog.lease, "catalog-sync");
        assert_eq!(config.catalog.pipeline.failure_policy, FailurePolicy::DeadLetter);
        assert_eq!(config.heartbeat.interval_secs, None);
        assert_eq!(config.heartbeat.lease, None);

        let options = config.catalog.pipeline.options();
        assert_eq!(options.capacity, 100);
        assert!(options.retry.should_retry(2));
        assert!(!options.retry.should_retry(3));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = HostConfig::from_json(r#"{ "catalgo": {} }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[test]
    fn zero_durations_are_invalid() {
        for raw in [
            r#"{ "catalog": { "interval_secs": 0 } }"#,
            r#"{ "catalog": { "pipeline": { "capacity": 0 } } }"#,
            r#"{ "heartbeat": { "interval_secs": 0 } }"#,
            r#"{ "lease_ttl_secs": 0 }"#,
            r#"{ "lease_ttl_secs": 10, "catalog": { "lease_refresh_secs": 10 } }"#,
            r#"{ "heartbeat": { "lease_refresh_secs": 0 } }"#,
        ] {
            let err = HostConfig::from_json(raw).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn heartbeat_refresh_must_beat_the_lease_ttl() {
        let err = HostConfig::from_json(r#"{ "lease_ttl_secs": 5, "catalog": { "lease_refresh_secs": 2 } }"#).unwrap_err();
        assert!(err.to_string().contains("heartbeat.lease_refresh_secs"), "{err}");

        let ok = HostConfig::from_json(
            r#"{ "lease_ttl_secs": 5, "catalog": { "lease_refresh_secs": 2 }, "heartbeat": { "lease_refresh_secs": 2 } }"#,
        );
        assert!(ok.is_ok());

        let unleased =
            HostConfig::from_json(r#"{ "lease_ttl_secs": 5, "catalog": { "lease_refresh_secs": 2 }, "heartbeat": { "lease": null } }"#);
        assert!(unleased.is_ok());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = HostConfig::from_path("/nonexistent/conductor.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/conductor.json"));
    }
}
