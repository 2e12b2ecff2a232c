use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use ferry_api::message::{SubscribeOptions, SubscriptionMode};
use ferry_engine::config::{BufferConfig, DeliveryConfig, LifecycleConfig, RelayConfig};
use ferry_engine::filter::TopicFilter;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "ferry-server", about = "Broker relay with a tool-call API")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to the broker and serve the tool API
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml", env = "FERRY_CONFIG")]
    pub config: String,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    pub broker: BrokerSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Mqtt,
    Kafka,
    Loopback,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Mqtt => "mqtt",
            Transport::Kafka => "kafka",
            Transport::Loopback => "loopback",
        }
    }
}

/// `[broker]`: which transport, what to subscribe at startup, and the
/// transport's own `[broker.config]` table.
#[derive(Debug, Deserialize)]
pub struct BrokerSection {
    pub transport: Transport,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Tool names are `<prefix>_status`, ... Defaults to the transport name.
    #[serde(default)]
    pub tool_prefix: Option<String>,
    /// Options for the initial subscriptions.
    #[serde(default, flatten)]
    pub subscribe: SubscribeOptions,
    /// Handed to the transport's config struct as is.
    #[serde(default)]
    pub config: Option<toml::Value>,
}

/// `[broker.config]` for `transport = "loopback"`.
#[derive(Debug, Deserialize)]
pub struct LoopbackConfig {
    #[serde(default = "default_loopback_mode")]
    pub mode: SubscriptionMode,
    /// Defaults to true in incremental mode.
    #[serde(default)]
    pub wildcards: Option<bool>,
}

fn default_api_port() -> u16 {
    9300
}
fn default_loopback_mode() -> SubscriptionMode {
    SubscriptionMode::Incremental
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config { context: "read", detail: format!("'{path}': {e}") })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ServerError::Config { context: "parse", detail: format!("'{path}': {e}") })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        self.relay()
            .validate()
            .map_err(|e| ServerError::Config { context: "validate", detail: e.to_string() })?;
        for topic in &self.broker.topics {
            TopicFilter::compile(topic)
                .map_err(|e| ServerError::Config { context: "broker.topics", detail: e.to_string() })?;
        }
        if let Some(prefix) = &self.broker.tool_prefix {
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(ServerError::Config {
                    context: "broker.tool_prefix",
                    detail: format!("'{prefix}' must be non-empty and use only [A-Za-z0-9_-]"),
                });
            }
        }
        Ok(())
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            buffer: self.buffer.clone(),
            lifecycle: self.lifecycle.clone(),
            delivery: self.delivery.clone(),
        }
    }

    pub fn tool_prefix(&self) -> &str {
        self.broker
            .tool_prefix
            .as_deref()
            .unwrap_or(self.broker.transport.as_str())
    }
}

impl BrokerSection {
    /// Deserialize `[broker.config]` into the transport's config struct.
    /// A missing table gives the struct's defaults.
    pub fn transport_config<T: serde::de::DeserializeOwned>(&self) -> Result<T, ServerError> {
        let value = self
            .config
            .clone()
            .unwrap_or_else(|| toml::Value::Table(toml::map::Map::new()));
        value.try_into().map_err(|e| ServerError::Config {
            context: "broker.config",
            detail: format!("{} config: {e}", self.transport.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ServerConfig {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(
            r#"
            [broker]
            transport = "mqtt"
            "#,
        );
        config.validate().unwrap();
        assert_eq!(config.api_port, 9300);
        assert_eq!(config.buffer.capacity, 10_000);
        assert_eq!(config.buffer.default_limit, 10);
        assert_eq!(config.tool_prefix(), "mqtt");
        assert!(config.broker.topics.is_empty());
    }

    #[test]
    fn full_config() {
        let config = parse(
            r#"
            api_port = 9400

            [buffer]
            capacity = 500

            [lifecycle.reconnect]
            max_attempts = 3

            [delivery]
            overflow = "back_pressure"

            [broker]
            transport = "kafka"
            topics = ["orders", "payments"]
            tool_prefix = "events"
            from_beginning = true

            [broker.config]
            brokers = ["kafka-1:9092"]
            client_id = "relay"
            "#,
        );
        config.validate().unwrap();
        assert_eq!(config.api_port, 9400);
        assert_eq!(config.relay().buffer.capacity, 500);
        assert_eq!(config.lifecycle.reconnect.max_attempts, 3);
        assert_eq!(config.tool_prefix(), "events");
        assert_eq!(config.broker.subscribe.from_beginning, Some(true));

        let kafka: broker_kafka::KafkaConfig = config.broker.transport_config().unwrap();
        assert_eq!(kafka.brokers, ["kafka-1:9092"]);
        assert_eq!(kafka.client_id, "relay");
    }

    #[test]
    fn missing_transport_table_uses_defaults() {
        let config = parse(
            r#"
            [broker]
            transport = "mqtt"
            "#,
        );
        let mqtt: broker_mqtt::MqttConfig = config.broker.transport_config().unwrap();
        assert!(mqtt.tls);
        assert_eq!(mqtt.host, "localhost");
    }

    #[test]
    fn loopback_mode_is_configurable() {
        let config = parse(
            r#"
            [broker]
            transport = "loopback"
            [broker.config]
            mode = "restart_required"
            "#,
        );
        let loopback: LoopbackConfig = config.broker.transport_config().unwrap();
        assert_eq!(loopback.mode, SubscriptionMode::RestartRequired);
        assert_eq!(loopback.wildcards, None);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = parse(
            r#"
            [buffer]
            capacity = 0
            [broker]
            transport = "loopback"
            "#,
        );
        assert!(matches!(config.validate(), Err(ServerError::Config { context: "validate", .. })));
    }

    #[test]
    fn malformed_initial_topic_is_rejected() {
        let config = parse(
            r#"
            [broker]
            transport = "mqtt"
            topics = ["sensors/#/temp"]
            "#,
        );
        assert!(matches!(config.validate(), Err(ServerError::Config { context: "broker.topics", .. })));
    }

    #[test]
    fn unknown_transport_fails_to_parse() {
        let result: Result<ServerConfig, _> = toml::from_str(
            r#"
            [broker]
            transport = "amqp"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn bad_tool_prefix_is_rejected() {
        let config = parse(
            r#"
            [broker]
            transport = "mqtt"
            tool_prefix = "my tools"
            "#,
        );
        assert!(config.validate().is_err());
    }
}
