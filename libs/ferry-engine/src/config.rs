use std::time::Duration;

use serde::Deserialize;

use ferry_api::message::OverflowPolicy;

use crate::buffer::{DEFAULT_CAPACITY, DEFAULT_READ_LIMIT};
use crate::error::RelayError;

/// Engine configuration: the `[buffer]`, `[lifecycle]` and `[delivery]`
/// sections of the server config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.buffer.capacity == 0 {
            return Err(RelayError::Config("buffer.capacity must be at least 1".into()));
        }
        if self.buffer.default_limit == 0 {
            return Err(RelayError::Config("buffer.default_limit must be at least 1".into()));
        }
        if self.delivery.buffer == 0 {
            return Err(RelayError::Config("delivery.buffer must be at least 1".into()));
        }
        let reconnect = &self.lifecycle.reconnect;
        if reconnect.multiplier < 1.0 {
            return Err(RelayError::Config(
                "lifecycle.reconnect.multiplier must be >= 1.0".into(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(RelayError::Config(
                "lifecycle.reconnect.max_delay_ms must be >= initial_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [buffer]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Maximum number of records kept; the oldest is evicted first.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Records returned by a read that doesn't specify a limit.
    #[serde(default = "default_read_limit")]
    pub default_limit: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_limit: default_read_limit(),
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_read_limit() -> usize {
    DEFAULT_READ_LIMIT
}

// ---------------------------------------------------------------------------
// [lifecycle]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for a whole subscription change, stop/restart included.
    #[serde(default = "default_change_timeout_ms")]
    pub change_timeout_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            change_timeout_ms: default_change_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl LifecycleConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn change_timeout(&self) -> Duration {
        Duration::from_millis(self.change_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_change_timeout_ms() -> u64 {
    30_000
}
fn default_publish_timeout_ms() -> u64 {
    10_000
}

/// Reconnection after an asynchronously detected connection loss.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Attempts before giving up (0 = unlimited).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based): exponential, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

fn default_true() -> bool {
    true
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    10
}

// ---------------------------------------------------------------------------
// [delivery]
// ---------------------------------------------------------------------------

/// Channel between the broker connection and the ingestion loop.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_buffer")]
    pub buffer: usize,
    #[serde(default = "default_delivery_overflow")]
    pub overflow: OverflowPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            buffer: default_delivery_buffer(),
            overflow: default_delivery_overflow(),
        }
    }
}

fn default_delivery_buffer() -> usize {
    1024
}
fn default_delivery_overflow() -> OverflowPolicy {
    OverflowPolicy::BackPressure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.buffer.capacity, 10_000);
        assert_eq!(config.buffer.default_limit, 10);
        assert_eq!(config.delivery.overflow, OverflowPolicy::BackPressure);
        assert!(config.lifecycle.reconnect.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [buffer]
            capacity = 3

            [lifecycle]
            change_timeout_ms = 500

            [lifecycle.reconnect]
            max_attempts = 2

            [delivery]
            overflow = "drop"
            "#,
        )
        .unwrap();
        assert_eq!(config.buffer.capacity, 3);
        assert_eq!(config.lifecycle.change_timeout(), Duration::from_millis(500));
        assert_eq!(config.lifecycle.reconnect.max_attempts, 2);
        assert_eq!(config.delivery.overflow, OverflowPolicy::Drop);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = RelayConfig::default();
        config.buffer.capacity = 0;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectConfig {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            max_attempts: 3,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }
}
