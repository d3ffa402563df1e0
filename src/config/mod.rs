//! Typed configuration.
//!
//! Read from a TOML or JSON file (chosen by extension), then overridden by
//! `TASKQ_*` environment variables, then validated. Everything numeric is
//! checked here so a bad value fails before any worker starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::maintenance::RetentionMode;
use crate::model::{Capabilities, CapabilityValue, capability};
use crate::retry::{AttemptLimits, RetryPolicy};
use crate::scheduling::{SchedulingStrategy, StrategyKind};

/// Prefix for environment overrides, e.g. `TASKQ_LEASE_DURATION_SECONDS`.
pub const ENV_PREFIX: &str = "TASKQ_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Unique name for this worker process. Required.
    pub worker_id: String,
    pub scheduling_strategy: StrategyKind,
    pub lease_duration_seconds: u64,
    pub poll_interval_seconds: u64,
    /// Default `max_attempts` for tasks that don't set their own.
    pub max_retries: u32,
    pub store_path: PathBuf,
    pub heartbeat_interval_seconds: u64,
    /// Heartbeat age after which a worker counts as stale.
    pub stale_after_seconds: u64,
    pub retry_base_seconds: u64,
    pub retry_max_seconds: u64,
    pub log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otel_endpoint: Option<String>,
    pub capabilities: Capabilities,
    /// Per-type overrides of `max_retries`.
    pub attempt_limits: HashMap<String, u32>,
    pub maintenance: MaintenanceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            scheduling_strategy: StrategyKind::Priority,
            lease_duration_seconds: 60,
            poll_interval_seconds: 1,
            max_retries: 3,
            store_path: PathBuf::from("taskq.db"),
            heartbeat_interval_seconds: 10,
            stale_after_seconds: 30,
            retry_base_seconds: 1,
            retry_max_seconds: 300,
            log_level: "info".to_string(),
            otel_endpoint: None,
            capabilities: Capabilities::new(),
            attempt_limits: HashMap::new(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Settings for the housekeeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    pub interval_seconds: u64,
    /// Terminal tasks older than this are removed.
    pub retention_seconds: u64,
    pub retention_mode: RetentionMode,
    pub vacuum_batch_size: u32,
    /// Lease expiries tolerated before a task is failed.
    pub max_reclaims: u32,
    /// Workers silent for this long are deleted from the registry.
    pub worker_sweep_after_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    pub backup_interval_seconds: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            retention_seconds: 7 * 24 * 3600,
            retention_mode: RetentionMode::Delete,
            vacuum_batch_size: 500,
            max_reclaims: 10,
            worker_sweep_after_seconds: 24 * 3600,
            backup_dir: None,
            backup_interval_seconds: 3600,
        }
    }
}

impl Config {
    /// Defaults with the given worker id.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    /// Load from `path` (or defaults), apply process environment overrides,
    /// and validate.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a file by extension: `.toml` or `.json`. Not validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            _ => Err(Error::Validation(format!(
                "unsupported config format for {} (expected .toml or .json)",
                path.display()
            ))),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Validation(format!("invalid TOML config: {e}")))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("invalid JSON config: {e}")))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Other(format!("TOML encode: {e}")))
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply `TASKQ_*` overrides from `vars`. Unrelated variables are ignored.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            let m = &mut self.maintenance;
            match name {
                "WORKER_ID" => self.worker_id = value.to_string(),
                "SCHEDULING_STRATEGY" => self.scheduling_strategy = value.parse()?,
                "LEASE_DURATION_SECONDS" => self.lease_duration_seconds = int(name, value)?,
                "POLL_INTERVAL_SECONDS" => self.poll_interval_seconds = int(name, value)?,
                "MAX_RETRIES" => self.max_retries = int(name, value)?,
                "STORE_PATH" => self.store_path = PathBuf::from(value),
                "HEARTBEAT_INTERVAL_SECONDS" => self.heartbeat_interval_seconds = int(name, value)?,
                "STALE_AFTER_SECONDS" => self.stale_after_seconds = int(name, value)?,
                "RETRY_BASE_SECONDS" => self.retry_base_seconds = int(name, value)?,
                "RETRY_MAX_SECONDS" => self.retry_max_seconds = int(name, value)?,
                "LOG_LEVEL" => self.log_level = value.to_string(),
                "OTEL_ENDPOINT" => {
                    self.otel_endpoint = Some(value).filter(|v| !v.is_empty()).map(str::to_string)
                }
                "CAPABILITIES" => self.capabilities = parse_capabilities(value)?,
                "MAINTENANCE_INTERVAL_SECONDS" => m.interval_seconds = int(name, value)?,
                "RETENTION_SECONDS" => m.retention_seconds = int(name, value)?,
                "RETENTION_MODE" => m.retention_mode = value.parse()?,
                "VACUUM_BATCH_SIZE" => m.vacuum_batch_size = int(name, value)?,
                "MAX_RECLAIMS" => m.max_reclaims = int(name, value)?,
                "WORKER_SWEEP_AFTER_SECONDS" => m.worker_sweep_after_seconds = int(name, value)?,
                "BACKUP_DIR" => {
                    m.backup_dir = Some(value).filter(|v| !v.is_empty()).map(PathBuf::from)
                }
                "BACKUP_INTERVAL_SECONDS" => m.backup_interval_seconds = int(name, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(Error::Validation("worker_id is required".to_string()));
        }
        let positive = [
            ("lease_duration_seconds", self.lease_duration_seconds),
            ("poll_interval_seconds", self.poll_interval_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("stale_after_seconds", self.stale_after_seconds),
            ("retry_base_seconds", self.retry_base_seconds),
            ("maintenance.interval_seconds", self.maintenance.interval_seconds),
            ("maintenance.vacuum_batch_size", u64::from(self.maintenance.vacuum_batch_size)),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Error::Validation(format!("{field} must be greater than 0")));
            }
        }
        if self.max_retries == 0 {
            return Err(Error::Validation("max_retries must be at least 1".to_string()));
        }
        if self.retry_max_seconds < self.retry_base_seconds {
            return Err(Error::Validation(
                "retry_max_seconds must not be below retry_base_seconds".to_string(),
            ));
        }
        if self.heartbeat_interval_seconds >= self.lease_duration_seconds {
            return Err(Error::Validation(
                "heartbeat_interval_seconds must be shorter than lease_duration_seconds"
                    .to_string(),
            ));
        }
        if let Some((task_type, _)) = self.attempt_limits.iter().find(|(_, n)| **n == 0) {
            return Err(Error::Validation(format!(
                "attempt_limits.{task_type} must be at least 1"
            )));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_duration_seconds as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_seconds as i64)
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        SchedulingStrategy::from(self.scheduling_strategy)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_base_seconds),
            Duration::from_secs(self.retry_max_seconds),
        )
    }

    pub fn attempt_limits(&self) -> AttemptLimits {
        self.attempt_limits.iter().fold(
            AttemptLimits::new(self.max_retries),
            |limits, (task_type, n)| limits.with_type(task_type.clone(), *n),
        )
    }
}

fn int<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Validation(format!(
            "{ENV_PREFIX}{name} must be a non-negative integer, got '{value}'"
        ))
    })
}

/// `{"gpu": true}` or `gpu=true,region=eu`.
fn parse_capabilities(raw: &str) -> Result<Capabilities> {
    let raw = raw.trim();
    if raw.starts_with('{') {
        return serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("{ENV_PREFIX}CAPABILITIES: {e}")));
    }
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(capability::parse_pair)
        .collect::<Result<Vec<(String, CapabilityValue)>>>()
        .map(|pairs| pairs.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::new("w1");
        assert_eq!(config.lease_duration_seconds, 60);
        assert_eq!(config.poll_interval_seconds, 1);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.scheduling_strategy, StrategyKind::Priority);
        assert_eq!(config.maintenance.vacuum_batch_size, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_worker_id_is_rejected() {
        assert!(matches!(
            Config::default().validate(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn capabilities_parse_from_pairs_and_json() {
        let pairs = parse_capabilities("gpu=true, cores=8,region=eu").unwrap();
        assert_eq!(pairs.get("gpu"), Some(&CapabilityValue::Bool(true)));
        assert_eq!(pairs.get("cores"), Some(&CapabilityValue::Int(8)));
        assert_eq!(
            pairs.get("region"),
            Some(&CapabilityValue::Text("eu".into()))
        );

        let json = parse_capabilities(r#"{"gpu": true, "cores": 8}"#).unwrap();
        assert_eq!(json.len(), 2);
        assert!(parse_capabilities("").unwrap().is_empty());
    }

    #[test]
    fn attempt_limits_include_per_type_overrides() {
        let mut config = Config::new("w1");
        config.attempt_limits.insert("email".into(), 7);
        let limits = config.attempt_limits();
        assert_eq!(limits.resolve("email", None), 7);
        assert_eq!(limits.resolve("echo", None), 3);
    }
}
