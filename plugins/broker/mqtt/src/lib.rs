mod config;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, SubAck,
    SubscribeReasonCode, Transport,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ferry_api::broker::BrokerConnection;
use ferry_api::delivery::LinkHandle;
use ferry_api::error::TransportError;
use ferry_api::message::{OutgoingMessage, PublishReceipt, SubscribeOptions, SubscriptionMode};
use ferry_api::record::IncomingRecord;

pub use config::{MqttConfig, PLAIN_PORT, TLS_PORT};

/// How long `disconnect` lets the event loop flush the DISCONNECT packet.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

struct Session {
    client: AsyncClient,
    token: CancellationToken,
    task: JoinHandle<()>,
}

// ═══════════════════════════════════════════════════════════════
//  MqttBroker
// ═══════════════════════════════════════════════════════════════

/// MQTT 3.1.1 connection on `rumqttc`.
///
/// Topics are added and removed one at a time on the live session, `+`/`#`
/// filters included. The client runs with a clean session; the engine
/// re-subscribes after every reconnect.
pub struct MqttBroker {
    config: MqttConfig,
    client_id: String,
    tls: Option<Transport>,
    session: Mutex<Option<Session>>,
}

impl MqttBroker {
    /// Validate the config and load TLS material. No network I/O.
    pub fn new(config: MqttConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let tls = config.load_tls()?;
        let client_id = config.client_id.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("ferry-mqtt-{}", &id[..8])
        });
        Ok(Self {
            config,
            client_id,
            tls,
            session: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("mqtt session lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.lock()
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or_else(TransportError::not_connected)
    }
}

impl BrokerConnection for MqttBroker {
    fn transport(&self) -> &str {
        "mqtt"
    }

    fn mode(&self) -> SubscriptionMode {
        SubscriptionMode::Incremental
    }

    fn supports_wildcards(&self) -> bool {
        true
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "host": self.config.host,
            "port": self.config.port(),
            "tls": self.config.tls,
            "client_id": self.client_id,
            "username": self.config.username,
            "keep_alive_secs": self.config.keep_alive_secs,
        })
    }

    fn connect(
        &self,
        link: LinkHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let opts = self.config.options(&self.client_id, self.tls.clone());
            let (client, event_loop) = AsyncClient::new(opts, self.config.channel_capacity);

            let token = CancellationToken::new();
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(run_event_loop(event_loop, link, ready_tx, token.clone()));

            // Dropping this future before CONNACK (connect timeout) stops the loop.
            let guard = token.clone().drop_guard();
            match ready_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(TransportError::connect("event loop ended before CONNACK")),
            }
            guard.disarm();

            tracing::info!(
                host = %self.config.host,
                port = self.config.port(),
                tls = self.config.tls,
                client_id = %self.client_id,
                "mqtt connected"
            );

            if let Some(old) = self.lock().replace(Session { client, token, task }) {
                old.token.cancel();
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let Some(mut session) = self.lock().take() else {
                return Ok(());
            };

            let result = session
                .client
                .disconnect()
                .await
                .map_err(|e| TransportError::io(format!("mqtt disconnect: {e}")));

            if tokio::time::timeout(DISCONNECT_GRACE, &mut session.task).await.is_err() {
                session.token.cancel();
                let _ = session.task.await;
            }
            session.token.cancel();
            result
        })
    }

    fn subscribe(
        &self,
        topics: Vec<String>,
        opts: SubscribeOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let qos = config::qos(opts.qos.unwrap_or(self.config.default_qos))?;
            let client = self.client()?;
            for topic in topics {
                client
                    .subscribe(topic.as_str(), qos)
                    .await
                    .map_err(|e| TransportError::rejected(format!("subscribe '{topic}': {e}")))?;
                tracing::debug!(topic = %topic, ?qos, "mqtt subscribe sent");
            }
            Ok(())
        })
    }

    fn unsubscribe(
        &self,
        topic: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.client()?
                .unsubscribe(topic.as_str())
                .await
                .map_err(|e| TransportError::rejected(format!("unsubscribe '{topic}': {e}")))
        })
    }

    fn publish(
        &self,
        message: OutgoingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let qos = config::qos(message.qos.unwrap_or(0))?;
            if message.key.is_some() || !message.headers.is_empty() {
                tracing::debug!(topic = %message.topic, "mqtt has no key or headers, ignoring them");
            }
            self.client()?
                .publish(message.topic.as_str(), qos, message.retain, message.payload)
                .await
                .map_err(|e| TransportError::rejected(format!("publish '{}': {e}", message.topic)))?;

            Ok(PublishReceipt {
                topic: message.topic,
                partition: None,
                offset: None,
            })
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Event loop
// ═══════════════════════════════════════════════════════════════

/// Drive `rumqttc` for one session: report the CONNACK outcome on `ready`,
/// forward publishes to the engine and report a lost session once.
async fn run_event_loop(
    mut event_loop: EventLoop,
    link: LinkHandle,
    ready: oneshot::Sender<Result<(), TransportError>>,
    token: CancellationToken,
) {
    let mut ready = Some(ready);

    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::debug!(code = ?ack.code, "mqtt CONNACK");
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let record = IncomingRecord {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    qos: Some(config::qos_level(publish.qos)),
                    retain: Some(publish.retain),
                    ..Default::default()
                };
                let delivered = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    delivered = link.records().deliver(record) => delivered,
                };
                match delivered {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(topic = %publish.topic, "delivery channel full, mqtt message dropped");
                    }
                    Err(_) => break,
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let denied = denied_filters(&ack);
                if denied > 0 {
                    tracing::warn!(
                        pkid = ack.pkid,
                        denied,
                        requested = ack.return_codes.len(),
                        "broker refused mqtt subscription, topic stays in the set but receives nothing"
                    );
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                link.report_lost("broker sent DISCONNECT");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(classify(&e)));
                    }
                    None => link.report_lost(format!("mqtt: {e}")),
                }
                break;
            }
        }
    }

    tracing::debug!(generation = link.generation(), "mqtt event loop stopped");
}

/// Number of filters in a SUBACK the broker answered with `Failure` (0x80).
fn denied_filters(ack: &SubAck) -> usize {
    ack.return_codes
        .iter()
        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
        .count()
}

fn classify(e: &ConnectionError) -> TransportError {
    match e {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => TransportError::auth(format!("broker refused credentials: {code:?}")),
        other => TransportError::connect(other.to_string()),
    }
}
