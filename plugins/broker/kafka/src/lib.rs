mod config;
mod partitioner;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use rskafka::client::consumer::{StartOffset, StreamConsumerBuilder};
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ferry_api::broker::BrokerConnection;
use ferry_api::delivery::LinkHandle;
use ferry_api::error::TransportError;
use ferry_api::message::{OutgoingMessage, PublishReceipt, SubscribeOptions, SubscriptionMode};
use ferry_api::record::IncomingRecord;

pub use config::KafkaConfig;

/// Pause after a failed fetch before polling the partition again.
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

type PartitionKey = (String, i32);
type Positions = Arc<Mutex<HashMap<PartitionKey, i64>>>;

#[derive(Debug, Clone)]
struct TopicAssignment {
    topic: String,
    partitions: Vec<i32>,
    from_beginning: bool,
}

struct Consumers {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    client: Option<Arc<Client>>,
    link: Option<LinkHandle>,
    assignments: Vec<TopicAssignment>,
    /// Partition ids per topic, from metadata.
    partitions: HashMap<String, Vec<i32>>,
    partition_clients: HashMap<PartitionKey, Arc<PartitionClient>>,
    consumers: Option<Consumers>,
}

// ═══════════════════════════════════════════════════════════════
//  KafkaBroker
// ═══════════════════════════════════════════════════════════════

/// Kafka connection on `rskafka`.
///
/// Consumes every partition of every subscribed topic directly, without a
/// consumer group. A topic-set change needs the consume loop stopped,
/// the whole set replaced and the loop started again. The next offset of
/// each partition is remembered, so a restart resumes where it stopped.
pub struct KafkaBroker {
    config: KafkaConfig,
    bootstrap: Vec<String>,
    tls: Option<Arc<rustls::ClientConfig>>,
    inner: Mutex<Inner>,
    positions: Positions,
    round_robin: AtomicUsize,
}

impl KafkaBroker {
    /// Validate the config and load TLS material. No network I/O.
    pub fn new(config: KafkaConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let bootstrap = config.bootstrap()?;
        let tls = config.load_tls()?;
        Ok(Self {
            config,
            bootstrap,
            tls,
            inner: Mutex::new(Inner::default()),
            positions: Arc::new(Mutex::new(HashMap::new())),
            round_robin: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("kafka session lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn client(&self) -> Result<Arc<Client>, TransportError> {
        self.lock().client.clone().ok_or_else(TransportError::not_connected)
    }

    /// Partition ids of `topic`, from cache or fresh metadata.
    async fn partitions_of(&self, topic: &str) -> Result<Vec<i32>, TransportError> {
        if let Some(p) = self.lock().partitions.get(topic) {
            return Ok(p.clone());
        }
        self.refresh_metadata().await?;
        self.lock()
            .partitions
            .get(topic)
            .cloned()
            .ok_or_else(|| TransportError::rejected(format!("unknown kafka topic '{topic}'")))
    }

    async fn refresh_metadata(&self) -> Result<(), TransportError> {
        let client = self.client()?;
        let topics = client
            .list_topics()
            .await
            .map_err(|e| TransportError::connect(format!("list topics: {e}")))?;
        let partitions = topics
            .into_iter()
            .map(|t| (t.name, t.partitions.into_iter().collect()))
            .collect();
        self.lock().partitions = partitions;
        Ok(())
    }

    async fn partition_client(&self, topic: &str, partition: i32) -> Result<Arc<PartitionClient>, TransportError> {
        let key = (topic.to_string(), partition);
        if let Some(pc) = self.lock().partition_clients.get(&key) {
            return Ok(pc.clone());
        }
        let client = self.client()?;
        let pc = client
            .partition_client(topic, partition, UnknownTopicHandling::Error)
            .await
            .map_err(|e| TransportError::rejected(format!("{topic}/{partition}: {e}")))?;
        let pc = Arc::new(pc);
        self.lock().partition_clients.insert(key, pc.clone());
        Ok(pc)
    }

    async fn stop_consumers(&self) {
        let consumers = self.lock().consumers.take();
        if let Some(consumers) = consumers {
            consumers.token.cancel();
            for task in consumers.tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "kafka partition consumer failed");
                }
            }
        }
    }

    fn choose_partition(&self, message: &OutgoingMessage, partitions: &[i32]) -> Result<i32, TransportError> {
        if partitions.is_empty() {
            return Err(TransportError::rejected(format!(
                "kafka topic '{}' has no partitions",
                message.topic
            )));
        }
        if let Some(p) = message.partition {
            if !partitions.contains(&p) {
                return Err(TransportError::rejected(format!(
                    "kafka topic '{}' has no partition {p}",
                    message.topic
                )));
            }
            return Ok(p);
        }
        let idx = match &message.key {
            Some(key) => partitioner::partition_for_key(key.as_bytes(), partitions.len()),
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % partitions.len(),
        };
        Ok(partitions[idx])
    }
}

impl BrokerConnection for KafkaBroker {
    fn transport(&self) -> &str {
        "kafka"
    }

    fn mode(&self) -> SubscriptionMode {
        SubscriptionMode::RestartRequired
    }

    fn supports_wildcards(&self) -> bool {
        false
    }

    fn describe(&self) -> serde_json::Value {
        let inner = self.lock();
        let assigned: usize = inner.assignments.iter().map(|a| a.partitions.len()).sum();
        serde_json::json!({
            "brokers": self.bootstrap,
            "client_id": self.config.client_id,
            "group_id": self.config.group_id,
            "from_beginning": self.config.from_beginning,
            "sasl_user": self.config.username,
            "tls": self.config.tls,
            "assigned_partitions": assigned,
            "consuming": inner.consumers.is_some(),
        })
    }

    fn connect(
        &self,
        link: LinkHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = ClientBuilder::new(self.bootstrap.clone()).client_id(self.config.client_id.clone());
            if let Some(sasl) = self.config.sasl() {
                builder = builder.sasl_config(sasl);
            }
            if let Some(tls) = &self.tls {
                builder = builder.tls_config(tls.clone());
            }
            let client = builder
                .build()
                .await
                .map_err(|e| TransportError::connect(format!("kafka bootstrap {:?}: {e}", self.bootstrap)))?;

            {
                let mut inner = self.lock();
                inner.client = Some(Arc::new(client));
                inner.link = Some(link);
                inner.partition_clients.clear();
            }
            self.refresh_metadata().await?;

            tracing::info!(
                brokers = ?self.bootstrap,
                client_id = %self.config.client_id,
                tls = self.config.tls,
                sasl_user = ?self.config.username,
                "kafka connected"
            );
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.stop_consumers().await;
            let mut inner = self.lock();
            inner.client = None;
            inner.link = None;
            inner.assignments.clear();
            inner.partition_clients.clear();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: Vec<String>,
        opts: SubscribeOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.refresh_metadata().await?;

            let mut inner = self.lock();
            let mut next = Vec::with_capacity(topics.len());
            for topic in topics {
                let partitions = inner
                    .partitions
                    .get(&topic)
                    .cloned()
                    .ok_or_else(|| TransportError::rejected(format!("unknown kafka topic '{topic}'")))?;
                let from_beginning = inner
                    .assignments
                    .iter()
                    .find(|a| a.topic == topic)
                    .map(|a| a.from_beginning)
                    .unwrap_or_else(|| opts.from_beginning.unwrap_or(self.config.from_beginning));
                next.push(TopicAssignment {
                    topic,
                    partitions,
                    from_beginning,
                });
            }

            // Forget positions of topics that are no longer subscribed.
            {
                let mut positions = lock_positions(&self.positions);
                positions.retain(|(topic, _), _| next.iter().any(|a| &a.topic == topic));
            }

            tracing::info!(
                topics = ?next.iter().map(|a| a.topic.as_str()).collect::<Vec<_>>(),
                "kafka topic set replaced"
            );
            inner.assignments = next;
            Ok(())
        })
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let (link, assignments) = {
                let inner = self.lock();
                if inner.consumers.is_some() {
                    return Ok(());
                }
                let link = inner.link.clone().ok_or_else(TransportError::not_connected)?;
                (link, inner.assignments.clone())
            };

            // --- resolve partition clients before spawning anything
            let mut targets = Vec::new();
            for assignment in &assignments {
                for &partition in &assignment.partitions {
                    let pc = self.partition_client(&assignment.topic, partition).await?;
                    let position = lock_positions(&self.positions)
                        .get(&(assignment.topic.clone(), partition))
                        .copied();
                    let start = match position {
                        Some(next) => StartOffset::At(next),
                        None if assignment.from_beginning => StartOffset::Earliest,
                        None => StartOffset::Latest,
                    };
                    targets.push((assignment.topic.clone(), partition, pc, start));
                }
            }

            let token = CancellationToken::new();
            let tasks = targets
                .into_iter()
                .map(|(topic, partition, pc, start)| {
                    tokio::spawn(consume_partition(PartitionConsumer {
                        topic,
                        partition,
                        client: pc,
                        start,
                        max_wait_ms: self.config.max_wait_ms,
                        max_consecutive_errors: self.config.max_consecutive_errors,
                        link: link.clone(),
                        positions: self.positions.clone(),
                        token: token.clone(),
                    }))
                })
                .collect::<Vec<_>>();

            tracing::info!(partitions = tasks.len(), "kafka consumers started");
            self.lock().consumers = Some(Consumers { token, tasks });
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.stop_consumers().await;
            tracing::info!("kafka consumers stopped");
            Ok(())
        })
    }

    fn publish(
        &self,
        message: OutgoingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let partitions = self.partitions_of(&message.topic).await?;
            let partition = self.choose_partition(&message, &partitions)?;
            let pc = self.partition_client(&message.topic, partition).await?;

            let record = Record {
                key: message.key.map(String::into_bytes),
                value: Some(message.payload),
                headers: message
                    .headers
                    .into_iter()
                    .map(|(k, v)| (k, v.into_bytes()))
                    .collect::<BTreeMap<_, _>>(),
                timestamp: chrono::Utc::now(),
            };
            let offsets = pc
                .produce(vec![record], Compression::NoCompression)
                .await
                .map_err(|e| TransportError::rejected(format!("produce to {}/{partition}: {e}", message.topic)))?;

            Ok(PublishReceipt {
                topic: message.topic,
                partition: Some(partition),
                offset: offsets.first().copied(),
            })
        })
    }
}

fn lock_positions(positions: &Positions) -> MutexGuard<'_, HashMap<PartitionKey, i64>> {
    match positions.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Partition consumer
// ═══════════════════════════════════════════════════════════════

struct PartitionConsumer {
    topic: String,
    partition: i32,
    client: Arc<PartitionClient>,
    start: StartOffset,
    max_wait_ms: i32,
    max_consecutive_errors: u32,
    link: LinkHandle,
    positions: Positions,
    token: CancellationToken,
}

/// Fetch one partition until cancelled. The stored position only advances
/// after a record was handed to the engine.
async fn consume_partition(c: PartitionConsumer) {
    tracing::debug!(topic = %c.topic, partition = c.partition, start = ?c.start, "partition consumer started");

    let mut stream = StreamConsumerBuilder::new(c.client.clone(), c.start)
        .with_max_wait_ms(c.max_wait_ms)
        .build();
    let mut failures: u32 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = c.token.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok((fetched, _high_watermark))) => {
                failures = 0;
                let offset = fetched.offset;
                let record = fetched.record;
                let incoming = IncomingRecord {
                    topic: c.topic.clone(),
                    payload: record.value.unwrap_or_default(),
                    key: record.key,
                    partition: Some(c.partition),
                    offset: Some(offset),
                    headers: record.headers.into_iter().collect(),
                    timestamp_ms: Some(record.timestamp.timestamp_millis()),
                    ..Default::default()
                };

                let delivered = tokio::select! {
                    biased;
                    _ = c.token.cancelled() => break,
                    delivered = c.link.records().deliver(incoming) => delivered,
                };
                match delivered {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(
                        topic = %c.topic,
                        partition = c.partition,
                        offset,
                        "delivery channel full, kafka record dropped"
                    ),
                    Err(_) => break,
                }
                lock_positions(&c.positions).insert((c.topic.clone(), c.partition), offset + 1);
            }
            Some(Err(e)) => {
                failures += 1;
                tracing::warn!(topic = %c.topic, partition = c.partition, failures, error = %e, "kafka fetch failed");
                if failures >= c.max_consecutive_errors {
                    c.link.report_lost(format!("kafka {}/{}: {e}", c.topic, c.partition));
                    break;
                }
                tokio::select! {
                    _ = c.token.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_RETRY_DELAY) => {}
                }
            }
            None => break,
        }
    }

    tracing::debug!(topic = %c.topic, partition = c.partition, "partition consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> KafkaBroker {
        KafkaBroker::new(KafkaConfig::default()).unwrap()
    }

    #[test]
    fn describe_reports_auth_without_the_password() {
        let broker = KafkaBroker::new(KafkaConfig {
            username: Some("svc".into()),
            password: Some("secret".into()),
            tls: true,
            ..Default::default()
        })
        .unwrap();
        let details = broker.describe();
        assert_eq!(details["sasl_user"], "svc");
        assert_eq!(details["tls"], true);
        assert!(!details.to_string().contains("secret"));
    }

    #[test]
    fn restart_required_contract() {
        let broker = broker();
        assert_eq!(broker.mode(), SubscriptionMode::RestartRequired);
        assert!(!broker.supports_wildcards());
        assert_eq!(broker.describe()["brokers"][0], "localhost:9092");
    }

    #[test]
    fn explicit_partition_wins() {
        let broker = broker();
        let mut message = OutgoingMessage::new("orders", "x");
        message.partition = Some(2);
        message.key = Some("k".into());
        assert_eq!(broker.choose_partition(&message, &[0, 1, 2]).unwrap(), 2);

        message.partition = Some(9);
        assert!(broker.choose_partition(&message, &[0, 1, 2]).is_err());
    }

    #[test]
    fn keyed_messages_are_sticky() {
        let broker = broker();
        let mut message = OutgoingMessage::new("orders", "x");
        message.key = Some("customer-7".into());
        let first = broker.choose_partition(&message, &[0, 1, 2, 3]).unwrap();
        for _ in 0..5 {
            assert_eq!(broker.choose_partition(&message, &[0, 1, 2, 3]).unwrap(), first);
        }
    }

    #[test]
    fn unkeyed_messages_rotate() {
        let broker = broker();
        let message = OutgoingMessage::new("orders", "x");
        let picked: Vec<i32> = (0..4)
            .map(|_| broker.choose_partition(&message, &[0, 1]).unwrap())
            .collect();
        assert_eq!(picked, [0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn operations_need_a_session() {
        let broker = broker();
        let err = broker
            .subscribe(vec!["orders".into()], SubscribeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ferry_api::error::TransportErrorKind::NotConnected);
        assert!(broker.stop().await.is_ok());
        assert!(broker.disconnect().await.is_ok());
    }
}
