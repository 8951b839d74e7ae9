//! Configuration management for the mission engine.
//!
//! Configuration can be set via environment variables (all optional):
//! - `MISSION_WORKERS` - Worker pool size shared by all missions. Defaults to `4`.
//! - `MISSION_MAX_TASKS` - Maximum tasks per plan. Defaults to `256`.
//! - `MISSION_MAX_DEPTH` - Maximum dependency-chain length. Defaults to `64`.
//! - `MISSION_DEFAULT_MAX_ATTEMPTS` - Attempts for tasks that do not set their own. Defaults to `3`.
//! - `MISSION_TOOL_TIMEOUT_MS` - Per-attempt timeout. Defaults to `30000`.
//! - `MISSION_MAX_RESULT_BYTES` - Cap on a stored task result. Defaults to `1048576`.
//! - `MISSION_RETRY_BASE_MS` - First retry delay. Defaults to `500`.
//! - `MISSION_RETRY_MAX_MS` - Retry delay cap. Defaults to `30000`.
//! - `MISSION_RETRY_JITTER` - Jitter fraction in `[0, 1]`. Defaults to `0.2`.
//! - `MISSION_MAX_CIRCUIT_DEFERRALS` - Circuit-open rejections tolerated per task. Defaults to `20`.
//! - `MISSION_BREAKER_THRESHOLD` - Failures in the window that open a circuit. Defaults to `5`.
//! - `MISSION_BREAKER_WINDOW_MS` - Sliding failure window. Defaults to `60000`.
//! - `MISSION_BREAKER_COOLDOWN_MS` - Open time before a probe is allowed. Defaults to `30000`.
//! - `WORKSPACE_PATH` - Root for the built-in file tools. Defaults to current directory.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Bounds enforced by the plan validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLimits {
    pub max_tasks: usize,
    pub max_depth: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_tasks: 256,
            max_depth: 64,
        }
    }
}

/// Backoff parameters for task retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay that may be shaved off at random
    pub jitter: f64,
    /// Circuit-open rejections tolerated before the task fails
    pub max_circuit_deferrals: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_circuit_deferrals: 20,
        }
    }
}

/// Circuit breaker tuning, applied to every tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Worker pool size
    pub workers: usize,

    pub limits: PlanLimits,

    /// Applied to tasks without an explicit `max_attempts`
    pub default_max_attempts: u32,

    /// Applied to tasks without an explicit `timeout_ms`
    pub tool_timeout: Duration,

    /// Larger results are truncated before being stored on the task
    pub max_result_bytes: usize,

    pub retry: RetryConfig,

    pub breaker: BreakerConfig,

    /// Root for the built-in file tools
    pub workspace_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            limits: PlanLimits::default(),
            default_max_attempts: 3,
            tool_timeout: Duration::from_secs(30),
            max_result_bytes: 1024 * 1024,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            workspace_path: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` if a variable is set but unparsable
    /// or out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        if std::env::var("WORKSPACE_PATH").is_err() {
            config.workspace_path =
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        }
        Ok(config)
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let workers: usize = parse_or(&lookup, "MISSION_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(invalid("MISSION_WORKERS", "must be at least 1"));
        }

        let default_max_attempts: u32 = parse_or(
            &lookup,
            "MISSION_DEFAULT_MAX_ATTEMPTS",
            defaults.default_max_attempts,
        )?;
        if default_max_attempts == 0 {
            return Err(invalid("MISSION_DEFAULT_MAX_ATTEMPTS", "must be at least 1"));
        }

        let jitter: f64 = parse_or(&lookup, "MISSION_RETRY_JITTER", defaults.retry.jitter)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(invalid("MISSION_RETRY_JITTER", "must be between 0 and 1"));
        }

        let failure_threshold: u32 = parse_or(
            &lookup,
            "MISSION_BREAKER_THRESHOLD",
            defaults.breaker.failure_threshold,
        )?;
        if failure_threshold == 0 {
            return Err(invalid("MISSION_BREAKER_THRESHOLD", "must be at least 1"));
        }

        let base_delay = millis_or(&lookup, "MISSION_RETRY_BASE_MS", defaults.retry.base_delay)?;
        let max_delay = millis_or(&lookup, "MISSION_RETRY_MAX_MS", defaults.retry.max_delay)?;
        if max_delay < base_delay {
            return Err(invalid(
                "MISSION_RETRY_MAX_MS",
                "must not be below MISSION_RETRY_BASE_MS",
            ));
        }

        Ok(Self {
            workers,
            limits: PlanLimits {
                max_tasks: parse_or(&lookup, "MISSION_MAX_TASKS", defaults.limits.max_tasks)?,
                max_depth: parse_or(&lookup, "MISSION_MAX_DEPTH", defaults.limits.max_depth)?,
            },
            default_max_attempts,
            tool_timeout: millis_or(&lookup, "MISSION_TOOL_TIMEOUT_MS", defaults.tool_timeout)?,
            max_result_bytes: parse_or(
                &lookup,
                "MISSION_MAX_RESULT_BYTES",
                defaults.max_result_bytes,
            )?,
            retry: RetryConfig {
                base_delay,
                max_delay,
                jitter,
                max_circuit_deferrals: parse_or(
                    &lookup,
                    "MISSION_MAX_CIRCUIT_DEFERRALS",
                    defaults.retry.max_circuit_deferrals,
                )?,
            },
            breaker: BreakerConfig {
                failure_threshold,
                window: millis_or(&lookup, "MISSION_BREAKER_WINDOW_MS", defaults.breaker.window)?,
                cooldown: millis_or(
                    &lookup,
                    "MISSION_BREAKER_COOLDOWN_MS",
                    defaults.breaker.cooldown,
                )?,
            },
            workspace_path: lookup("WORKSPACE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_path),
        })
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue(key.to_string(), message.into())
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("{}", e))),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_circuit_deferrals, 20);
    }

    #[test]
    fn test_overrides_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MISSION_WORKERS", "8"),
            ("MISSION_RETRY_BASE_MS", "10"),
            ("MISSION_RETRY_JITTER", "0"),
            ("MISSION_BREAKER_COOLDOWN_MS", "250"),
            ("WORKSPACE_PATH", "/tmp/ws"),
        ]))
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.retry.jitter, 0.0);
        assert_eq!(config.breaker.cooldown, Duration::from_millis(250));
        assert_eq!(config.workspace_path, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("MISSION_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(key, _) if key == "MISSION_WORKERS"));

        assert!(EngineConfig::from_lookup(lookup(&[("MISSION_WORKERS", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("MISSION_RETRY_JITTER", "1.5")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[
            ("MISSION_RETRY_BASE_MS", "5000"),
            ("MISSION_RETRY_MAX_MS", "100"),
        ]))
        .is_err());
    }
}
