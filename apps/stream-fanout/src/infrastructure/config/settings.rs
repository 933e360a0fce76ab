//! Service Configuration Settings
//!
//! Configuration types for the fan-out service, loaded from environment
//! variables. Absent or unparseable values fall back to defaults; values that
//! would make the registry misbehave are rejected.

use std::time::Duration;

use crate::application::services::RegistryConfig;
use crate::domain::streaming::DEFAULT_HEAP_CAPACITY;
use crate::domain::subscription::StalePolicy;

/// Registry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Health sweep period.
    pub sweep_interval: Duration,
    /// Whether the ping loop runs.
    pub ping_enabled: bool,
    /// Ping period.
    pub ping_interval: Duration,
    /// Bound on after-removed hooks during shutdown.
    pub removal_timeout: Duration,
    /// Dispatch queue initial capacity.
    pub queue_capacity: usize,
    /// Stale batch rule.
    pub stale_policy: StalePolicy,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            ping_enabled: false,
            ping_interval: Duration::from_secs(30),
            removal_timeout: Duration::from_secs(60),
            queue_capacity: DEFAULT_HEAP_CAPACITY,
            stale_policy: StalePolicy::OlderThanCursor,
        }
    }
}

impl From<StreamSettings> for RegistryConfig {
    fn from(settings: StreamSettings) -> Self {
        Self {
            sweep_interval: settings.sweep_interval,
            ping_interval: settings.ping_enabled.then_some(settings.ping_interval),
            removal_timeout: settings.removal_timeout,
            queue_capacity: settings.queue_capacity,
            stale_policy: settings.stale_policy,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { metrics_port: 9090 }
    }
}

/// Demo producer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSettings {
    /// Number of subscribers to register.
    pub subscribers: usize,
    /// Live publish period.
    pub tick_interval: Duration,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            subscribers: 3,
            tick_interval: Duration::from_millis(250),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Registry settings.
    pub stream: StreamSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Demo producer settings.
    pub demo: DemoSettings,
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an interval is zero or the stale policy is not
    /// recognised.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let stream_defaults = StreamSettings::default();

        let stale_policy = match lookup("STREAM_FANOUT_STALE_POLICY") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "STREAM_FANOUT_STALE_POLICY".to_string(),
                value,
            })?,
            None => stream_defaults.stale_policy,
        };

        let stream = StreamSettings {
            sweep_interval: non_zero(
                "STREAM_FANOUT_SWEEP_INTERVAL_MS",
                parse_duration_millis(
                    &lookup,
                    "STREAM_FANOUT_SWEEP_INTERVAL_MS",
                    stream_defaults.sweep_interval,
                ),
            )?,
            ping_enabled: parse_bool(
                &lookup,
                "STREAM_FANOUT_PING_ENABLED",
                stream_defaults.ping_enabled,
            ),
            ping_interval: non_zero(
                "STREAM_FANOUT_PING_INTERVAL_MS",
                parse_duration_millis(
                    &lookup,
                    "STREAM_FANOUT_PING_INTERVAL_MS",
                    stream_defaults.ping_interval,
                ),
            )?,
            removal_timeout: parse_duration_secs(
                &lookup,
                "STREAM_FANOUT_REMOVAL_TIMEOUT_SECS",
                stream_defaults.removal_timeout,
            ),
            queue_capacity: parse_value(
                &lookup,
                "STREAM_FANOUT_QUEUE_CAPACITY",
                stream_defaults.queue_capacity,
            )
            .max(1),
            stale_policy,
        };

        let server = ServerSettings {
            metrics_port: parse_value(
                &lookup,
                "STREAM_FANOUT_METRICS_PORT",
                ServerSettings::default().metrics_port,
            ),
        };

        let demo = DemoSettings {
            subscribers: parse_value(
                &lookup,
                "STREAM_FANOUT_DEMO_SUBSCRIBERS",
                DemoSettings::default().subscribers,
            ),
            tick_interval: non_zero(
                "STREAM_FANOUT_DEMO_TICK_MS",
                parse_duration_millis(
                    &lookup,
                    "STREAM_FANOUT_DEMO_TICK_MS",
                    DemoSettings::default().tick_interval,
                ),
            )?,
        };

        Ok(Self {
            stream,
            server,
            demo,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has a value that cannot be used.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
    /// Interval configured as zero.
    #[error("environment variable {0} must be greater than zero")]
    ZeroDuration(String),
}

fn non_zero(key: &str, duration: Duration) -> Result<Duration, ConfigError> {
    if duration.is_zero() {
        Err(ConfigError::ZeroDuration(key.to_string()))
    } else {
        Ok(duration)
    }
}

fn parse_value<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map_or(default, |v| {
        matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes")
    })
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.stream.sweep_interval, Duration::from_secs(10));
        assert_eq!(config.stream.removal_timeout, Duration::from_secs(60));
        assert_eq!(config.stream.queue_capacity, 128);
        assert_eq!(config.server.metrics_port, 9090);
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("STREAM_FANOUT_SWEEP_INTERVAL_MS", "2500"),
            ("STREAM_FANOUT_PING_ENABLED", "true"),
            ("STREAM_FANOUT_PING_INTERVAL_MS", "1000"),
            ("STREAM_FANOUT_REMOVAL_TIMEOUT_SECS", "5"),
            ("STREAM_FANOUT_QUEUE_CAPACITY", "256"),
            ("STREAM_FANOUT_STALE_POLICY", "not-after"),
            ("STREAM_FANOUT_METRICS_PORT", "0"),
        ])
        .unwrap();

        assert_eq!(config.stream.sweep_interval, Duration::from_millis(2500));
        assert!(config.stream.ping_enabled);
        assert_eq!(config.stream.ping_interval, Duration::from_secs(1));
        assert_eq!(config.stream.removal_timeout, Duration::from_secs(5));
        assert_eq!(config.stream.queue_capacity, 256);
        assert_eq!(config.stream.stale_policy, StalePolicy::NotAfterCursor);
        assert_eq!(config.server.metrics_port, 0);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        let config = config_from(&[
            ("STREAM_FANOUT_QUEUE_CAPACITY", "lots"),
            ("STREAM_FANOUT_METRICS_PORT", "99999"),
        ])
        .unwrap();
        assert_eq!(config.stream.queue_capacity, 128);
        assert_eq!(config.server.metrics_port, 9090);
    }

    #[test_case("STREAM_FANOUT_SWEEP_INTERVAL_MS" ; "sweep interval")]
    #[test_case("STREAM_FANOUT_PING_INTERVAL_MS" ; "ping interval")]
    #[test_case("STREAM_FANOUT_DEMO_TICK_MS" ; "demo tick")]
    fn zero_interval_rejected(key: &str) {
        assert_eq!(
            config_from(&[(key, "0")]),
            Err(ConfigError::ZeroDuration(key.to_string()))
        );
    }

    #[test]
    fn unknown_stale_policy_rejected() {
        let err = config_from(&[("STREAM_FANOUT_STALE_POLICY", "newest")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "STREAM_FANOUT_STALE_POLICY".to_string(),
                value: "newest".to_string(),
            }
        );
    }

    #[test_case("true", true)]
    #[test_case("1", true)]
    #[test_case("FALSE", false)]
    #[test_case("nope", false)]
    fn ping_enabled_parsing(value: &str, expected: bool) {
        let config = config_from(&[("STREAM_FANOUT_PING_ENABLED", value)]).unwrap();
        assert_eq!(config.stream.ping_enabled, expected);
    }

    #[test]
    fn registry_config_from_settings() {
        let disabled = RegistryConfig::from(StreamSettings::default());
        assert_eq!(disabled.ping_interval, None);

        let enabled = RegistryConfig::from(StreamSettings {
            ping_enabled: true,
            ping_interval: Duration::from_millis(1500),
            ..StreamSettings::default()
        });
        assert_eq!(enabled.ping_interval, Some(Duration::from_millis(1500)));
        assert_eq!(enabled.queue_capacity, 128);
    }
}
