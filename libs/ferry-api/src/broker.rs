use std::future::Future;
use std::pin::Pin;

use crate::delivery::LinkHandle;
use crate::error::TransportError;
use crate::message::{OutgoingMessage, PublishReceipt, SubscribeOptions, SubscriptionMode};

/// A live connection to an external broker.
///
/// The engine doesn't know the wire protocol. For the engine, a broker is
/// just this trait: it connects, changes its topic set according to its
/// `SubscriptionMode`, publishes, and pushes received records into the
/// `LinkHandle` it was given on `connect`.
///
/// Calls are serialized by the engine for everything except `publish`.
pub trait BrokerConnection: Send + Sync {
    /// Short transport name ("mqtt", "kafka", ...).
    fn transport(&self) -> &str;

    fn mode(&self) -> SubscriptionMode;

    /// Whether `+`/`#` topic patterns may be subscribed.
    fn supports_wildcards(&self) -> bool;

    /// Connection details for status reporting. Must not contain secrets.
    fn describe(&self) -> serde_json::Value;

    /// Open a session. Resolves once the broker accepted the connection.
    /// Records and connection-loss events for this session go to `link`.
    fn connect(
        &self,
        link: LinkHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Close the session. Best effort; the engine logs errors and moves on.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// `Incremental`: add `topics` to the live subscription.
    /// `RestartRequired`: replace the whole topic set with `topics`
    /// (called only while the consume loop is stopped).
    fn subscribe(
        &self,
        topics: Vec<String>,
        opts: SubscribeOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Remove one topic from the live subscription (`Incremental` only).
    fn unsubscribe(
        &self,
        topic: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            Err(TransportError::unsupported(format!(
                "{} cannot unsubscribe '{topic}' in place",
                self.transport()
            )))
        })
    }

    /// Start the consume loop for the current topic set (`RestartRequired` only).
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    /// Stop the consume loop (`RestartRequired` only).
    ///
    /// Resolves once the loop has terminated: after that, nothing more is
    /// delivered until the next `start`.
    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn publish(
        &self,
        message: OutgoingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, TransportError>> + Send + '_>>;
}
