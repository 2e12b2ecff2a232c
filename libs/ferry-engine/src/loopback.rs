use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ferry_api::broker::BrokerConnection;
use ferry_api::delivery::LinkHandle;
use ferry_api::error::TransportError;
use ferry_api::message::{OutgoingMessage, PublishReceipt, SubscribeOptions, SubscriptionMode};
use ferry_api::record::IncomingRecord;

use crate::filter::TopicFilter;

/// One call the engine made on the broker, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Connect,
    Disconnect,
    Subscribe(Vec<String>),
    Unsubscribe(String),
    Start,
    Stop,
    Publish(String),
}

#[derive(Default)]
struct Inner {
    link: Option<LinkHandle>,
    subscriptions: Vec<TopicFilter>,
    streaming: bool,
    next_offset: i64,
    fail_connects: u32,
    connect_delay: Duration,
    change_delay: Duration,
    calls: Vec<BrokerCall>,
}

// ═══════════════════════════════════════════════════════════════
//  LoopbackBroker
// ═══════════════════════════════════════════════════════════════

/// In-process broker. Published messages come back to matching
/// subscriptions of the same connection.
///
/// In `RestartRequired` mode it behaves like a consumer: records flow only
/// between `start` and `stop`, and `subscribe` replaces the topic set.
/// Also carries fault hooks (failed or slow connects, slow subscription
/// changes, dropped sessions) for exercising the lifecycle.
pub struct LoopbackBroker {
    mode: SubscriptionMode,
    wildcards: bool,
    inner: Mutex<Inner>,
}

impl LoopbackBroker {
    pub fn new(mode: SubscriptionMode) -> Self {
        Self {
            mode,
            wildcards: mode == SubscriptionMode::Incremental,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_wildcards(mut self, enabled: bool) -> Self {
        self.wildcards = enabled;
        self
    }

    // ---------------------------------------------------------------------------
    // fault hooks
    // ---------------------------------------------------------------------------

    /// Reject the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Delay every `subscribe`/`unsubscribe`.
    pub fn set_change_delay(&self, delay: Duration) {
        self.lock().change_delay = delay;
    }

    /// Push a raw record into the current session as if the broker had
    /// delivered it. Returns `false` when there is no session.
    pub async fn inject(&self, record: IncomingRecord) -> bool {
        let link = self.lock().link.clone();
        match link {
            Some(link) => link.records().deliver(record).await.unwrap_or(false),
            None => false,
        }
    }

    /// Kill the current session and report it as lost.
    pub fn drop_connection(&self, reason: &str) {
        let link = {
            let mut inner = self.lock();
            inner.streaming = false;
            inner.subscriptions.clear();
            inner.link.take()
        };
        if let Some(link) = link {
            link.report_lost(reason);
        }
    }

    // ---------------------------------------------------------------------------
    // inspection
    // ---------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    /// Patterns subscribed on the broker side, in subscription order.
    pub fn subscribed(&self) -> Vec<String> {
        self.lock()
            .subscriptions
            .iter()
            .map(|f| f.pattern().to_string())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("loopback broker lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn connected(&self) -> Result<MutexGuard<'_, Inner>, TransportError> {
        let inner = self.lock();
        if inner.link.is_none() {
            return Err(TransportError::not_connected());
        }
        Ok(inner)
    }
}

impl BrokerConnection for LoopbackBroker {
    fn transport(&self) -> &str {
        "loopback"
    }

    fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    fn supports_wildcards(&self) -> bool {
        self.wildcards
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "broker": "loopback",
            "mode": self.mode,
            "streaming": self.is_streaming(),
        })
    }

    fn connect(
        &self,
        link: LinkHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let delay = {
                let mut inner = self.lock();
                inner.calls.push(BrokerCall::Connect);
                inner.connect_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut inner = self.lock();
            if inner.fail_connects > 0 {
                inner.fail_connects -= 1;
                return Err(TransportError::connect("loopback refused the connection"));
            }
            inner.link = Some(link);
            inner.subscriptions.clear();
            inner.streaming = false;
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(BrokerCall::Disconnect);
            inner.link = None;
            inner.subscriptions.clear();
            inner.streaming = false;
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: Vec<String>,
        _opts: SubscribeOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let delay = {
                let mut inner = self.connected()?;
                inner.calls.push(BrokerCall::Subscribe(topics.clone()));
                inner.change_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut filters = Vec::with_capacity(topics.len());
            for topic in &topics {
                let filter = TopicFilter::compile(topic)
                    .map_err(|e| TransportError::rejected(e.to_string()))?;
                filters.push(filter);
            }

            let mut inner = self.connected()?;
            match self.mode {
                SubscriptionMode::Incremental => {
                    for filter in filters {
                        if !inner.subscriptions.contains(&filter) {
                            inner.subscriptions.push(filter);
                        }
                    }
                }
                SubscriptionMode::RestartRequired => inner.subscriptions = filters,
            }
            Ok(())
        })
    }

    fn unsubscribe(
        &self,
        topic: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            if self.mode != SubscriptionMode::Incremental {
                return Err(TransportError::unsupported(format!(
                    "loopback consumer cannot unsubscribe '{topic}' in place"
                )));
            }
            let delay = {
                let mut inner = self.connected()?;
                inner.calls.push(BrokerCall::Unsubscribe(topic.clone()));
                inner.change_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.connected()?.subscriptions.retain(|f| f.pattern() != topic);
            Ok(())
        })
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.connected()?;
            inner.calls.push(BrokerCall::Start);
            inner.streaming = true;
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(BrokerCall::Stop);
            inner.streaming = false;
            Ok(())
        })
    }

    fn publish(
        &self,
        message: OutgoingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let (link, offset) = {
                let mut inner = self.connected()?;
                inner.calls.push(BrokerCall::Publish(message.topic.clone()));
                let offset = inner.next_offset;
                inner.next_offset += 1;

                let listening = match self.mode {
                    SubscriptionMode::Incremental => true,
                    SubscriptionMode::RestartRequired => inner.streaming,
                };
                let matched = inner.subscriptions.iter().any(|f| f.matches(&message.topic));
                let link = if listening && matched { inner.link.clone() } else { None };
                (link, offset)
            };

            let partition = message.partition.or(match self.mode {
                SubscriptionMode::RestartRequired => Some(0),
                SubscriptionMode::Incremental => None,
            });
            let receipt = PublishReceipt {
                topic: message.topic.clone(),
                partition,
                offset: partition.map(|_| offset),
            };

            if let Some(link) = link {
                let (qos, retain) = match partition {
                    None => (Some(message.qos.unwrap_or(0)), Some(message.retain)),
                    Some(_) => (None, None),
                };
                let record = IncomingRecord {
                    topic: message.topic,
                    payload: message.payload,
                    key: message.key.map(String::into_bytes),
                    partition,
                    offset: receipt.offset,
                    qos,
                    retain,
                    headers: message
                        .headers
                        .into_iter()
                        .map(|(k, v)| (k, v.into_bytes()))
                        .collect(),
                    timestamp_ms: None,
                };
                if let Ok(false) = link.records().deliver(record).await {
                    tracing::warn!(topic = %receipt.topic, "loopback delivery channel full, record dropped");
                }
            }

            Ok(receipt)
        })
    }
}

#[cfg(test)]
mod tests {
    use ferry_api::delivery::DeliverySender;
    use ferry_api::message::OverflowPolicy;
    use tokio::sync::mpsc;

    use super::*;

    fn link() -> (LinkHandle, mpsc::Receiver<IncomingRecord>) {
        let (tx, rx) = mpsc::channel(16);
        let (events, _) = mpsc::unbounded_channel();
        (LinkHandle::new(DeliverySender::new(tx, OverflowPolicy::Drop), events, 1), rx)
    }

    #[tokio::test]
    async fn incremental_mode_delivers_to_matching_subscriptions() {
        let broker = LoopbackBroker::new(SubscriptionMode::Incremental);
        let (link, mut rx) = link();
        broker.connect(link).await.unwrap();
        broker
            .subscribe(vec!["sensors/+".into()], SubscribeOptions::default())
            .await
            .unwrap();

        broker.publish(OutgoingMessage::new("sensors/1", "21.5")).await.unwrap();
        broker.publish(OutgoingMessage::new("other", "x")).await.unwrap();

        let record = rx.try_recv().unwrap();
        assert_eq!(record.topic, "sensors/1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restart_mode_delivers_only_while_streaming() {
        let broker = LoopbackBroker::new(SubscriptionMode::RestartRequired);
        let (link, mut rx) = link();
        broker.connect(link).await.unwrap();
        broker
            .subscribe(vec!["orders".into()], SubscribeOptions::default())
            .await
            .unwrap();

        broker.publish(OutgoingMessage::new("orders", "early")).await.unwrap();
        assert!(rx.try_recv().is_err());

        broker.start().await.unwrap();
        let receipt = broker.publish(OutgoingMessage::new("orders", "live")).await.unwrap();
        assert_eq!(receipt.partition, Some(0));
        assert_eq!(rx.try_recv().unwrap().payload, b"live");
    }

    #[tokio::test]
    async fn failed_connects_are_counted_down() {
        let broker = LoopbackBroker::new(SubscriptionMode::Incremental);
        broker.fail_next_connects(1);
        assert!(broker.connect(link().0).await.is_err());
        assert!(broker.connect(link().0).await.is_ok());
        assert!(broker.is_connected());
    }
}
