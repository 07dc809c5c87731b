//! Broker configuration.
//!
//! Loaded from a TOML file with every section optional; defaults match the
//! values in the protocol documentation.  `validate()` runs at bootstrap and
//! refuses to start the broker on hard errors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl BrokerConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.burst_size == 0 {
            return Err(Error::Config("rate_limit.burst_size must be > 0".into()));
        }
        if self.rate_limit.tokens_per_second <= 0.0 {
            return Err(Error::Config(
                "rate_limit.tokens_per_second must be > 0".into(),
            ));
        }
        if self.delivery.max_queue_size == 0 {
            return Err(Error::Config("delivery.max_queue_size must be > 0".into()));
        }
        if self.delivery.high_water_mark > self.delivery.max_queue_size {
            return Err(Error::Config(
                "delivery.high_water_mark must not exceed delivery.max_queue_size".into(),
            ));
        }
        if self.delivery.history_limit == 0 {
            return Err(Error::Config("delivery.history_limit must be > 0".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("breaker.failure_threshold must be > 0".into()));
        }
        if self.breaker.success_threshold == 0 {
            return Err(Error::Config("breaker.success_threshold must be > 0".into()));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_bind")]
    pub bind: String,
    /// State directory for the persisted session store.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: d_bind(),
            state_path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Consumer authentication timeout.
    #[serde(default = "d_5000")]
    pub auth_timeout_ms: u64,
    /// Capabilities handshake timeout.
    #[serde(default = "d_3000")]
    pub initialize_timeout_ms: u64,
    /// Idle session reaper interval; 0 disables.
    #[serde(default)]
    pub idle_timeout_ms: u64,
    /// Default adapter when `create_session` does not name one.
    #[serde(default = "d_adapter")]
    pub default_adapter: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 5000,
            initialize_timeout_ms: 3000,
            idle_timeout_ms: 0,
            default_adapter: d_adapter(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Token bucket capacity per consumer.
    #[serde(default = "d_burst")]
    pub burst_size: u32,
    /// Refill rate per consumer.
    #[serde(default = "d_tps")]
    pub tokens_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 10,
            tokens_per_second: 5.0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "d_hwm")]
    pub high_water_mark: usize,
    #[serde(default = "d_max_queue")]
    pub max_queue_size: usize,
    /// Message types that still enqueue above the high water mark.
    #[serde(default = "d_critical")]
    pub critical_types: Vec<String>,
    /// Replay-history ring bound per session.
    #[serde(default = "d_history")]
    pub history_limit: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            high_water_mark: d_hwm(),
            max_queue_size: d_max_queue(),
            critical_types: d_critical(),
            history_limit: d_history(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor & circuit breaker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "d_5000")]
    pub kill_grace_period_ms: u64,
    #[serde(default = "d_15000")]
    pub readiness_timeout_ms: u64,
    /// Exit within this window after spawn counts as a failure.
    #[serde(default = "d_2000")]
    pub quick_exit_window_ms: u64,
    /// Environment keys stripped before every spawn.
    #[serde(default)]
    pub env_deny_list: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kill_grace_period_ms: 5000,
            readiness_timeout_ms: 15_000,
            quick_exit_window_ms: 2000,
            env_deny_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "d_failures")]
    pub failure_threshold: u32,
    #[serde(default = "d_60000")]
    pub window_ms: u64,
    #[serde(default = "d_30000")]
    pub recovery_time_ms: u64,
    #[serde(default = "d_successes")]
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_ms: 60_000,
            recovery_time_ms: 30_000,
            success_threshold: 2,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_bind() -> String {
    "127.0.0.1:8787".into()
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./state")
}

fn d_adapter() -> String {
    "claude".into()
}

fn d_burst() -> u32 {
    10
}

fn d_tps() -> f64 {
    5.0
}

fn d_hwm() -> usize {
    64
}

fn d_max_queue() -> usize {
    256
}

fn d_critical() -> Vec<String> {
    vec![
        "permission_request".into(),
        "result".into(),
        "session_init".into(),
        "error".into(),
    ]
}

fn d_history() -> usize {
    1000
}

fn d_2000() -> u64 {
    2000
}

fn d_3000() -> u64 {
    3000
}

fn d_5000() -> u64 {
    5000
}

fn d_15000() -> u64 {
    15_000
}

fn d_30000() -> u64 {
    30_000
}

fn d_60000() -> u64 {
    60_000
}

fn d_failures() -> u32 {
    3
}

fn d_successes() -> u32 {
    2
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sessions.auth_timeout_ms, 5000);
        assert_eq!(config.sessions.initialize_timeout_ms, 3000);
        assert_eq!(config.supervisor.kill_grace_period_ms, 5000);
        assert_eq!(config.delivery.history_limit, 1000);
    }

    #[test]
    fn zero_burst_rejected() {
        let mut config = BrokerConfig::default();
        config.rate_limit.burst_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_watermarks_rejected() {
        let mut config = BrokerConfig::default();
        config.delivery.high_water_mark = 500;
        config.delivery.max_queue_size = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let raw = r#"
            [rate_limit]
            burst_size = 3

            [delivery]
            high_water_mark = 2
        "#;
        let config: BrokerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.rate_limit.burst_size, 3);
        assert_eq!(config.rate_limit.tokens_per_second, 5.0);
        assert_eq!(config.delivery.high_water_mark, 2);
        assert_eq!(config.delivery.max_queue_size, 256);
        assert!(config
            .delivery
            .critical_types
            .contains(&"permission_request".to_string()));
    }

    #[test]
    fn critical_types_overridable() {
        let raw = r#"
            [delivery]
            critical_types = ["result"]
        "#;
        let config: BrokerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.delivery.critical_types, vec!["result".to_string()]);
    }
}
