use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ferry_api::broker::BrokerConnection;
use ferry_api::message::{OutgoingMessage, PublishReceipt, SubscribeOptions, SubscriptionMode};

use crate::buffer::RecordBuffer;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::filter::TopicFilter;
use crate::lifecycle::{ChangeEntry, Controller, SubscriptionChange};
use crate::record::Record;
use crate::state::ConnectionState;

// ════════════════════════════════════════════════════════════════
//  Query / result types
// ════════════════════════════════════════════════════════════════

/// Arguments of `get_messages`. Every filter is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageQuery {
    /// `<= 0` or absent: the default read limit.
    #[serde(default)]
    pub limit: Option<i64>,
    /// Exact topic or `+`/`#` pattern.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub partition: Option<i32>,
    #[serde(default)]
    pub key: Option<String>,
}

/// `state` and `subscribed_topics` are read separately; when
/// `change_in_progress` is true they may straddle that change.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub transport: String,
    pub mode: SubscriptionMode,
    pub state: ConnectionState,
    pub connected: bool,
    pub subscribed_topics: Vec<String>,
    pub change_in_progress: bool,
    pub message_count: usize,
    pub capacity: usize,
    pub total_received: u64,
    pub evicted: u64,
    pub dropped: u64,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub connection: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesResult {
    pub count: usize,
    pub messages: Vec<Arc<Record>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeOutcome {
    pub topic: String,
    pub already_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnsubscribeOutcome {
    pub topic: String,
    pub was_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchEntry {
    pub topic: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub results: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearOutcome {
    pub cleared: usize,
}

// ════════════════════════════════════════════════════════════════
//  Relay
// ════════════════════════════════════════════════════════════════

/// One broker connection with its subscription set and record buffer.
///
/// This is the object the tool-call boundary talks to. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    controller: Controller,
    buffer: Arc<RecordBuffer>,
}

impl Relay {
    /// Build a relay around `connection`. Nothing is connected yet.
    /// Must be called from inside a tokio runtime.
    pub fn new(config: RelayConfig, connection: Arc<dyn BrokerConnection>) -> Result<Self, RelayError> {
        config.validate()?;
        let buffer = Arc::new(
            RecordBuffer::new(config.buffer.capacity).with_default_limit(config.buffer.default_limit),
        );
        let controller = Controller::new(config, connection, buffer.clone());
        Ok(Self { controller, buffer })
    }

    /// Build, connect and subscribe to the initial topics in one step.
    pub async fn bootstrap(
        config: RelayConfig,
        connection: Arc<dyn BrokerConnection>,
        topics: Vec<String>,
        opts: SubscribeOptions,
    ) -> Result<Self, RelayError> {
        // --- Step 1: validate topics before touching the network
        for topic in &topics {
            TopicFilter::compile(topic)?;
        }

        let relay = Self::new(config, connection)?;

        // --- Step 2: connect
        relay.connect().await?;

        // --- Step 3: initial subscriptions, one change for the whole list
        if !topics.is_empty() {
            let outcome = relay.subscribe_batch(topics, opts).await?;
            if outcome.failed > 0 {
                let failures: Vec<String> = outcome
                    .results
                    .iter()
                    .filter(|r| !r.success)
                    .map(|r| format!("{}: {}", r.topic, r.message))
                    .collect();
                relay.shutdown().await;
                return Err(RelayError::Subscribe(failures.join("; ")));
            }
        }

        tracing::info!(
            transport = relay.controller.connection().transport(),
            topics = ?relay.controller.subscriptions(),
            "relay ready"
        );
        Ok(relay)
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn buffer(&self) -> &Arc<RecordBuffer> {
        &self.buffer
    }

    pub fn transport(&self) -> &str {
        self.controller.connection().transport()
    }

    // ---------------------------------------------------------------------------
    // reads
    // ---------------------------------------------------------------------------

    pub fn status(&self) -> StatusReport {
        let connection = self.controller.connection();
        let snapshot = self.controller.snapshot();
        let stats = self.buffer.stats();
        StatusReport {
            transport: connection.transport().to_string(),
            mode: connection.mode(),
            state: snapshot.state,
            connected: snapshot.state.is_connected(),
            subscribed_topics: snapshot.subscriptions,
            change_in_progress: snapshot.change_in_progress,
            message_count: stats.len,
            capacity: stats.capacity,
            total_received: snapshot.received,
            evicted: stats.evicted,
            dropped: snapshot.dropped,
            reconnect_attempts: snapshot.reconnect_attempts,
            last_error: snapshot.last_error,
            connection: connection.describe(),
        }
    }

    /// Most recent matching records, oldest first. Filtering happens here,
    /// never at ingestion.
    pub fn get_messages(&self, query: &MessageQuery) -> Result<MessagesResult, RelayError> {
        let filter = query.topic.as_deref().map(TopicFilter::compile).transpose()?;
        let limit = query
            .limit
            .filter(|n| *n > 0)
            .map(|n| usize::try_from(n).unwrap_or(usize::MAX));

        let messages = self.buffer.snapshot(limit, |record| {
            if let Some(filter) = &filter {
                if !filter.matches(&record.topic) {
                    return false;
                }
            }
            if let Some(partition) = query.partition {
                if record.partition != Some(partition) {
                    return false;
                }
            }
            if let Some(key) = &query.key {
                if record.key.as_deref() != Some(key.as_str()) {
                    return false;
                }
            }
            true
        });

        Ok(MessagesResult {
            count: messages.len(),
            messages,
        })
    }

    pub fn clear_messages(&self) -> ClearOutcome {
        let cleared = self.buffer.clear();
        tracing::info!(cleared, "message buffer cleared");
        ClearOutcome { cleared }
    }

    // ---------------------------------------------------------------------------
    // writes
    // ---------------------------------------------------------------------------

    pub async fn publish(&self, message: OutgoingMessage) -> Result<PublishReceipt, RelayError> {
        self.controller.publish(message).await
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        opts: SubscribeOptions,
    ) -> Result<SubscribeOutcome, RelayError> {
        let entry = self
            .single_change(SubscriptionChange::Add(vec![topic.to_string()]), opts)
            .await?;
        Ok(SubscribeOutcome {
            topic: entry.topic,
            already_present: entry.outcome?,
        })
    }

    /// Subscribe to several topics with one lifecycle change. Per-topic
    /// failures are reported in the result; only a failure of the change as
    /// a whole is an `Err`.
    pub async fn subscribe_batch(
        &self,
        topics: Vec<String>,
        opts: SubscribeOptions,
    ) -> Result<BatchOutcome, RelayError> {
        let entries = self
            .controller
            .apply_subscription_change(SubscriptionChange::Add(topics), opts)
            .await?;

        let results: Vec<BatchEntry> = entries
            .into_iter()
            .map(|entry| match entry.outcome {
                Ok(true) => BatchEntry {
                    topic: entry.topic,
                    success: true,
                    message: "already subscribed".into(),
                },
                Ok(false) => BatchEntry {
                    topic: entry.topic,
                    success: true,
                    message: "subscribed".into(),
                },
                Err(e) => BatchEntry {
                    topic: entry.topic,
                    success: false,
                    message: e.to_string(),
                },
            })
            .collect();

        let success = results.iter().filter(|r| r.success).count();
        Ok(BatchOutcome {
            total: results.len(),
            success,
            failed: results.len() - success,
            results,
        })
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<UnsubscribeOutcome, RelayError> {
        let entry = self
            .single_change(
                SubscriptionChange::Remove(vec![topic.to_string()]),
                SubscribeOptions::default(),
            )
            .await?;
        Ok(UnsubscribeOutcome {
            topic: entry.topic,
            was_present: entry.outcome?,
        })
    }

    // ---------------------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------------------

    pub async fn connect(&self) -> Result<(), RelayError> {
        self.controller.connect().await
    }

    pub async fn disconnect(&self) {
        self.controller.disconnect().await
    }

    pub async fn shutdown(&self) {
        tracing::info!(transport = self.transport(), "shutting down relay");
        self.controller.shutdown().await
    }

    async fn single_change(
        &self,
        change: SubscriptionChange,
        opts: SubscribeOptions,
    ) -> Result<ChangeEntry, RelayError> {
        self.controller
            .apply_subscription_change(change, opts)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RelayError::InternalInvariant("subscription change returned no result".into()))
    }
}
