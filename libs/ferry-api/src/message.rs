use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  Subscription contract
// ════════════════════════════════════════════════════════════════

/// How a transport reacts to a change of its topic set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Topics are added/removed one at a time while streaming (MQTT).
    Incremental,
    /// The consume loop must be stopped, the whole topic set replaced and
    /// the loop restarted (Kafka consumer).
    RestartRequired,
}

impl std::fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionMode::Incremental => write!(f, "incremental"),
            SubscriptionMode::RestartRequired => write!(f, "restart_required"),
        }
    }
}

/// Per-request subscribe options. Each transport reads the fields it knows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// MQTT QoS level (0..=2).
    #[serde(default)]
    pub qos: Option<u8>,
    /// Kafka: start newly subscribed topics from the earliest offset.
    #[serde(default, alias = "fromBeginning")]
    pub from_beginning: Option<bool>,
}

// ════════════════════════════════════════════════════════════════
//  Overflow Policy
// ════════════════════════════════════════════════════════════════

/// Behaviour when a bounded delivery channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// try_send(): drop the record and log it.
    Drop,
    /// .send().await: wait for room (back-pressure on the broker reader).
    #[serde(alias = "backpressure")]
    BackPressure,
}

// ════════════════════════════════════════════════════════════════
//  Publish
// ════════════════════════════════════════════════════════════════

/// A message to hand to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub key: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Kafka target partition.
    pub partition: Option<i32>,
    /// MQTT QoS level (0..=2), default 0.
    pub qos: Option<u8>,
    /// MQTT retain flag.
    pub retain: bool,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }
}

/// Broker acknowledgement of a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}
