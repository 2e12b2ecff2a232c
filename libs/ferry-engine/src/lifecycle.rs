use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ferry_api::broker::BrokerConnection;
use ferry_api::delivery::{DeliverySender, LinkEvent, LinkHandle};
use ferry_api::message::{OutgoingMessage, PublishReceipt, SubscribeOptions, SubscriptionMode};
use ferry_api::record::IncomingRecord;

use crate::buffer::RecordBuffer;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::filter::TopicFilter;
use crate::ingest::{IngestCounters, spawn_ingestion};
use crate::state::{ConnectionState, StateCell, StateTransition};
use crate::subscription::SubscriptionSet;

// ════════════════════════════════════════════════════════════════
//  Public types
// ════════════════════════════════════════════════════════════════

/// A requested change of the topic set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    Add(Vec<String>),
    Remove(Vec<String>),
}

impl SubscriptionChange {
    fn topics(&self) -> &[String] {
        match self {
            SubscriptionChange::Add(t) | SubscriptionChange::Remove(t) => t,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            SubscriptionChange::Add(_) => "subscribe",
            SubscriptionChange::Remove(_) => "unsubscribe",
        }
    }
}

/// Per-topic result of a subscription change, in request order.
#[derive(Debug)]
pub struct ChangeEntry {
    pub topic: String,
    /// add: `already_present`; remove: `was_present`.
    pub outcome: Result<bool, RelayError>,
}

/// Snapshot of the controller's bookkeeping for `status`.
///
/// Fields are read one after another without stopping a concurrent
/// change. While `change_in_progress` is set, `state` and `subscriptions`
/// may come from different steps of that change.
#[derive(Debug, Clone)]
pub struct LifecycleSnapshot {
    pub state: ConnectionState,
    pub subscriptions: Vec<String>,
    pub change_in_progress: bool,
    pub received: u64,
    pub dropped: u64,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

// ════════════════════════════════════════════════════════════════
//  Shared state
// ════════════════════════════════════════════════════════════════

struct IngestSlot {
    token: CancellationToken,
    handle: JoinHandle<mpsc::Receiver<IncomingRecord>>,
}

/// Everything that only exists while a broker session is open. Guarded by
/// the lifecycle mutex; holding that mutex is what serializes connect,
/// disconnect and subscription changes.
#[derive(Default)]
struct Session {
    /// Receiving end of the session channel while no loop is running.
    idle_rx: Option<mpsc::Receiver<IncomingRecord>>,
    ingest: Option<IngestSlot>,
}

struct Shared {
    connection: Arc<dyn BrokerConnection>,
    config: RelayConfig,
    state: StateCell,
    subscriptions: RwLock<SubscriptionSet>,
    buffer: Arc<RecordBuffer>,
    counters: Arc<IngestCounters>,
    session: tokio::sync::Mutex<Session>,
    generation: AtomicU64,
    changing: AtomicBool,
    auto_reconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
}

/// Marks the subscription-change critical section. Entering it twice means
/// the lifecycle mutex failed to serialize callers.
struct ChangeGuard<'a>(&'a AtomicBool);

impl<'a> ChangeGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Result<Self, RelayError> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(RelayError::InternalInvariant(
                "subscription change entered while another is in flight".into(),
            ));
        }
        Ok(Self(flag))
    }
}

impl Drop for ChangeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ════════════════════════════════════════════════════════════════
//  Controller
// ════════════════════════════════════════════════════════════════

/// Connection lifecycle controller.
///
/// Owns the connection state and the subscription set, runs the ingestion
/// loop and reconnects after an asynchronously reported connection loss.
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Must be called from inside a tokio runtime: spawns the reconnect
    /// supervisor.
    pub fn new(
        config: RelayConfig,
        connection: Arc<dyn BrokerConnection>,
        buffer: Arc<RecordBuffer>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connection,
            config,
            state: StateCell::new(),
            subscriptions: RwLock::new(SubscriptionSet::new()),
            buffer,
            counters: Arc::new(IngestCounters::default()),
            session: tokio::sync::Mutex::new(Session::default()),
            generation: AtomicU64::new(0),
            changing: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(true),
            reconnect_attempts: AtomicU32::new(0),
            last_error: Mutex::new(None),
            link_tx,
            shutdown: CancellationToken::new(),
        });

        spawn_supervisor(Arc::downgrade(&shared), link_rx, shared.shutdown.clone());

        Self { shared }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.state.subscribe()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.read_subscriptions().to_vec()
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.shared.connection
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let s = &self.shared;
        // Flagged when a change was in flight at either end of the read.
        let change_in_progress = s.changing.load(Ordering::Acquire);
        let subscriptions = self.subscriptions();
        let state = s.state.get();
        LifecycleSnapshot {
            state,
            subscriptions,
            change_in_progress: change_in_progress || s.changing.load(Ordering::Acquire),
            received: s.counters.received.load(Ordering::Relaxed),
            dropped: s.counters.dropped.load(Ordering::Relaxed),
            reconnect_attempts: s.reconnect_attempts.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }

    // ---------------------------------------------------------------------------
    // connect / disconnect
    // ---------------------------------------------------------------------------

    /// Open the broker session and resume the current topic set.
    /// A no-op when a session is already open.
    pub async fn connect(&self) -> Result<(), RelayError> {
        self.shared.auto_reconnect.store(true, Ordering::Release);
        let mut session = self.shared.session.lock().await;
        self.open_locked(&mut session).await
    }

    /// Close the session from any state. Teardown errors are logged only.
    /// The subscription set is kept for the next `connect`.
    pub async fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::Release);
        let mut session = self.shared.session.lock().await;
        self.teardown_locked(&mut session).await;
    }

    /// Stop reconnecting, stop ingestion and close the session for good.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.disconnect().await;
    }

    // ---------------------------------------------------------------------------
    // subscription changes
    // ---------------------------------------------------------------------------

    /// Apply a topic-set change as one critical section, bounded by the
    /// change timeout. A timeout resets the session to `Disconnected`.
    ///
    /// Invalid topics fail individually; the rest of the change goes on.
    pub async fn apply_subscription_change(
        &self,
        change: SubscriptionChange,
        opts: SubscribeOptions,
    ) -> Result<Vec<ChangeEntry>, RelayError> {
        let mut session = self.shared.session.lock().await;
        let _guard = ChangeGuard::enter(&self.shared.changing)?;

        let after = self.shared.config.lifecycle.change_timeout();
        let outcome =
            tokio::time::timeout(after, self.change_locked(&mut session, &change, opts)).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op = change.verb(), ?after, "subscription change timed out, resetting session");
                self.teardown_locked(&mut session).await;
                let err = RelayError::Timeout {
                    operation: "subscription change",
                    after,
                };
                self.set_last_error(&err);
                Err(err)
            }
        }
    }

    async fn change_locked(
        &self,
        session: &mut Session,
        change: &SubscriptionChange,
        opts: SubscribeOptions,
    ) -> Result<Vec<ChangeEntry>, RelayError> {
        // --- validate, keeping request order
        let mut entries: Vec<ChangeEntry> = Vec::with_capacity(change.topics().len());
        let mut valid: Vec<usize> = Vec::new();
        for topic in change.topics() {
            let checked = match change {
                SubscriptionChange::Add(_) => self.validate_subscribe(topic, &opts),
                SubscriptionChange::Remove(_) => TopicFilter::compile(topic).map(|_| ()),
            };
            if checked.is_ok() {
                valid.push(entries.len());
            }
            entries.push(ChangeEntry {
                topic: topic.clone(),
                outcome: checked.map(|()| false),
            });
        }
        if valid.is_empty() {
            return Ok(entries);
        }

        // --- make sure a session is open
        if !self.shared.state.get().is_connected() {
            self.shared.auto_reconnect.store(true, Ordering::Release);
            self.open_locked(session).await?;
        }

        match self.shared.connection.mode() {
            SubscriptionMode::Incremental => {
                self.change_incremental(session, change, opts, &mut entries, &valid)
                    .await?
            }
            SubscriptionMode::RestartRequired => {
                self.change_with_restart(session, change, opts, &mut entries, &valid)
                    .await?
            }
        }
        Ok(entries)
    }

    fn validate_subscribe(&self, topic: &str, opts: &SubscribeOptions) -> Result<(), RelayError> {
        let filter = TopicFilter::compile(topic)?;
        if filter.is_wildcard() && !self.shared.connection.supports_wildcards() {
            return Err(RelayError::invalid_pattern(
                topic,
                "this transport does not support wildcard subscriptions",
            ));
        }
        if let Some(qos) = opts.qos {
            if qos > 2 {
                return Err(RelayError::Subscribe(format!("qos must be 0, 1 or 2, got {qos}")));
            }
        }
        Ok(())
    }

    /// Topics change in place; ingestion keeps running.
    async fn change_incremental(
        &self,
        session: &mut Session,
        change: &SubscriptionChange,
        opts: SubscribeOptions,
        entries: &mut [ChangeEntry],
        valid: &[usize],
    ) -> Result<(), RelayError> {
        let connection = &self.shared.connection;

        for &idx in valid {
            let topic = entries[idx].topic.clone();
            let outcome = match change {
                SubscriptionChange::Add(_) => {
                    if self.read_subscriptions().contains(&topic) {
                        Ok(true)
                    } else {
                        match connection.subscribe(vec![topic.clone()], opts.clone()).await {
                            Ok(()) => {
                                self.write_subscriptions().add(topic.clone());
                                tracing::info!(topic = %topic, "subscribed");
                                Ok(false)
                            }
                            Err(e) => Err(RelayError::Subscribe(e.to_string())),
                        }
                    }
                }
                SubscriptionChange::Remove(_) => {
                    if !self.read_subscriptions().contains(&topic) {
                        Ok(false)
                    } else {
                        match connection.unsubscribe(topic.clone()).await {
                            Ok(()) => {
                                self.write_subscriptions().remove(&topic);
                                tracing::info!(topic = %topic, "unsubscribed");
                                Ok(true)
                            }
                            Err(e) => Err(RelayError::Subscribe(e.to_string())),
                        }
                    }
                }
            };
            entries[idx].outcome = outcome;
        }

        if self.shared.state.get() == ConnectionState::Connected && !self.read_subscriptions().is_empty()
        {
            self.start_ingestion_locked(session).await?;
        }
        Ok(())
    }

    /// Stop the loop, replace the whole topic set, restart.
    ///
    /// Records the broker would have delivered between stop and start are
    /// not fetched by this session.
    async fn change_with_restart(
        &self,
        session: &mut Session,
        change: &SubscriptionChange,
        opts: SubscribeOptions,
        entries: &mut [ChangeEntry],
        valid: &[usize],
    ) -> Result<(), RelayError> {
        let current = self.read_subscriptions().clone();
        let mut next = current.clone();
        for &idx in valid {
            let entry = &mut entries[idx];
            entry.outcome = Ok(match change {
                SubscriptionChange::Add(_) => next.add(entry.topic.clone()).already_present,
                SubscriptionChange::Remove(_) => next.remove(&entry.topic).was_present,
            });
        }

        if next == current {
            return Ok(());
        }

        // --- stop
        self.stop_ingestion_locked(session).await?;

        // --- replace the set
        let connection = &self.shared.connection;
        if let Err(e) = connection.subscribe(next.to_vec(), opts).await {
            tracing::warn!(error = %e, "resubscribe failed, restoring previous topic set");
            if let Err(restore) = connection
                .subscribe(current.to_vec(), SubscribeOptions::default())
                .await
            {
                tracing::error!(error = %restore, "restoring previous topic set failed");
                self.teardown_locked(session).await;
                return Err(RelayError::Subscribe(e.to_string()));
            }
            if !current.is_empty() {
                self.start_ingestion_locked(session).await?;
            }
            return Err(RelayError::Subscribe(e.to_string()));
        }

        tracing::info!(topics = ?next.list(), "topic set replaced");
        *self.write_subscriptions() = next;

        // --- restart
        if !self.read_subscriptions().is_empty() {
            self.start_ingestion_locked(session).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // publish
    // ---------------------------------------------------------------------------

    /// Hand a message to the broker. Not serialized with lifecycle changes;
    /// failures are reported, never retried.
    pub async fn publish(&self, message: OutgoingMessage) -> Result<PublishReceipt, RelayError> {
        if message.topic.is_empty() {
            return Err(RelayError::Publish("topic must not be empty".into()));
        }
        if message.topic.contains(['+', '#']) {
            return Err(RelayError::Publish(format!(
                "wildcards are not allowed in a publish topic: '{}'",
                message.topic
            )));
        }
        if let Some(qos) = message.qos {
            if qos > 2 {
                return Err(RelayError::Publish(format!("qos must be 0, 1 or 2, got {qos}")));
            }
        }
        let state = self.shared.state.get();
        if !state.is_connected() {
            return Err(RelayError::Publish(format!("not connected (state: {state})")));
        }

        let topic = message.topic.clone();
        let after = self.shared.config.lifecycle.publish_timeout();
        match tokio::time::timeout(after, self.shared.connection.publish(message)).await {
            Ok(Ok(receipt)) => {
                tracing::debug!(topic = %topic, "published");
                Ok(receipt)
            }
            Ok(Err(e)) => Err(RelayError::Publish(e.to_string())),
            Err(_) => Err(RelayError::Publish(format!(
                "broker did not acknowledge within {after:?}"
            ))),
        }
    }

    // ---------------------------------------------------------------------------
    // session internals (lifecycle mutex held)
    // ---------------------------------------------------------------------------

    /// Connect if needed, then re-apply the whole topic set.
    async fn open_locked(&self, session: &mut Session) -> Result<(), RelayError> {
        if self.shared.state.get().is_connected() {
            return Ok(());
        }
        self.connect_locked(session).await?;

        if let Err(e) = self.resume_locked(session).await {
            tracing::warn!(error = %e, "could not restore subscriptions on the new session");
            self.teardown_locked(session).await;
            self.set_last_error(&e);
            return Err(e);
        }
        Ok(())
    }

    async fn connect_locked(&self, session: &mut Session) -> Result<(), RelayError> {
        let s = &self.shared;
        s.state.transition(ConnectionState::Connecting)?;

        let generation = s.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::channel(s.config.delivery.buffer);
        let link = LinkHandle::new(
            DeliverySender::new(tx, s.config.delivery.overflow),
            s.link_tx.clone(),
            generation,
        );

        let after = s.config.lifecycle.connect_timeout();
        let transport = s.connection.transport();
        match tokio::time::timeout(after, s.connection.connect(link)).await {
            Ok(Ok(())) => {
                session.idle_rx = Some(rx);
                s.state.transition(ConnectionState::Connected)?;
                tracing::info!(transport, generation, "connected");
                Ok(())
            }
            Ok(Err(e)) => {
                s.state.force_disconnected();
                let err = RelayError::from(e).with_context(format!("{transport} connect"));
                self.set_last_error(&err);
                Err(err)
            }
            Err(_) => {
                // The connect may have half-succeeded on the broker side.
                if let Err(e) = s.connection.disconnect().await {
                    tracing::debug!(transport, error = %e, "cleanup after connect timeout failed");
                }
                s.generation.fetch_add(1, Ordering::AcqRel);
                s.state.force_disconnected();
                let err = RelayError::Timeout {
                    operation: "connect",
                    after,
                };
                self.set_last_error(&err);
                Err(err)
            }
        }
    }

    async fn resume_locked(&self, session: &mut Session) -> Result<(), RelayError> {
        let topics = self.subscriptions();
        if topics.is_empty() {
            return Ok(());
        }
        tracing::info!(topics = ?topics, "restoring subscriptions");
        self.shared
            .connection
            .subscribe(topics, SubscribeOptions::default())
            .await
            .map_err(|e| RelayError::Subscribe(e.to_string()))?;
        self.start_ingestion_locked(session).await
    }

    /// Spawn the ingestion loop on the session channel and move to `Running`.
    async fn start_ingestion_locked(&self, session: &mut Session) -> Result<(), RelayError> {
        if session.ingest.is_some() {
            return Ok(());
        }
        let s = &self.shared;
        let rx = session.idle_rx.take().ok_or_else(|| {
            RelayError::InternalInvariant("no delivery channel for the open session".into())
        })?;

        let token = s.shutdown.child_token();
        let handle = spawn_ingestion(
            s.connection.transport().to_string(),
            rx,
            s.buffer.clone(),
            s.counters.clone(),
            token.clone(),
        );
        session.ingest = Some(IngestSlot { token, handle });

        if s.connection.mode() == SubscriptionMode::RestartRequired {
            if let Err(e) = s.connection.start().await {
                self.reclaim_receiver(session).await?;
                return Err(RelayError::from(e).with_context("start consuming"));
            }
        }

        s.state.transition(ConnectionState::Running)
    }

    /// `Running -> Stopping -> Connected`. Returns once the broker-side loop
    /// and the ingestion loop have both finished.
    async fn stop_ingestion_locked(&self, session: &mut Session) -> Result<(), RelayError> {
        if session.ingest.is_none() {
            return Ok(());
        }
        let s = &self.shared;
        let running = s.state.get() == ConnectionState::Running;
        if running {
            s.state.transition(ConnectionState::Stopping)?;
        }

        if s.connection.mode() == SubscriptionMode::RestartRequired {
            if let Err(e) = s.connection.stop().await {
                tracing::warn!(error = %e, "broker consume loop did not stop cleanly");
            }
        }
        self.reclaim_receiver(session).await?;

        if running {
            s.state.transition(ConnectionState::Connected)?;
        }
        Ok(())
    }

    /// Cancel the ingestion loop and put its receiver back into the session.
    async fn reclaim_receiver(&self, session: &mut Session) -> Result<(), RelayError> {
        let Some(slot) = session.ingest.take() else {
            return Ok(());
        };
        slot.token.cancel();
        match slot.handle.await {
            Ok(rx) => {
                session.idle_rx = Some(rx);
                Ok(())
            }
            Err(e) => Err(RelayError::InternalInvariant(format!(
                "ingestion loop failed: {e}"
            ))),
        }
    }

    /// Drop the session from any state. Best effort.
    async fn teardown_locked(&self, session: &mut Session) {
        let s = &self.shared;
        // Events from the session being torn down are stale from here on.
        s.generation.fetch_add(1, Ordering::AcqRel);

        if let Some(slot) = session.ingest.take() {
            slot.token.cancel();
            if let Err(e) = slot.handle.await {
                tracing::warn!(error = %e, "ingestion loop failed during teardown");
            }
        }
        session.idle_rx = None;

        if s.state.get() != ConnectionState::Disconnected {
            let transport = s.connection.transport();
            let after = s.config.lifecycle.connect_timeout();
            match tokio::time::timeout(after, s.connection.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(transport, error = %e, "disconnect failed"),
                Err(_) => tracing::warn!(transport, ?after, "disconnect timed out"),
            }
        }
        s.state.force_disconnected();
    }

    // ---------------------------------------------------------------------------
    // reconnect
    // ---------------------------------------------------------------------------

    async fn handle_lost(&self, generation: u64, reason: String) {
        let s = &self.shared;
        {
            let mut session = s.session.lock().await;
            if generation != s.generation.load(Ordering::Acquire) {
                tracing::debug!(generation, "ignoring loss of a stale session");
                return;
            }
            tracing::warn!(transport = s.connection.transport(), reason = %reason, "connection lost");
            self.set_last_error_message(format!("connection lost: {reason}"));
            self.teardown_locked(&mut session).await;
        }

        if s.config.lifecycle.reconnect.enabled && s.auto_reconnect.load(Ordering::Acquire) {
            self.reconnect().await;
        }
    }

    async fn reconnect(&self) {
        let s = &self.shared;
        let policy = &s.config.lifecycle.reconnect;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if policy.exhausted(attempt) {
                tracing::error!(attempts = attempt - 1, "giving up reconnecting");
                self.set_last_error_message(format!(
                    "reconnect gave up after {} attempts",
                    attempt - 1
                ));
                return;
            }

            let delay = policy.delay_for(attempt);
            tracing::info!(attempt, ?delay, "reconnecting");
            tokio::select! {
                _ = s.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut session = s.session.lock().await;
            if !s.auto_reconnect.load(Ordering::Acquire) || s.state.get().is_connected() {
                return;
            }
            s.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            match self.open_locked(&mut session).await {
                Ok(()) => {
                    tracing::info!(attempt, "reconnected");
                    return;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }
    }

    // ---------------------------------------------------------------------------

    fn read_subscriptions(&self) -> RwLockReadGuard<'_, SubscriptionSet> {
        match self.shared.subscriptions.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("subscription set read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_subscriptions(&self) -> RwLockWriteGuard<'_, SubscriptionSet> {
        match self.shared.subscriptions.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("subscription set write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        match self.shared.last_error.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_last_error(&self, err: &RelayError) {
        self.set_last_error_message(err.to_string());
    }

    fn set_last_error_message(&self, message: String) {
        let mut guard = match self.shared.last_error.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(message);
    }
}

/// Listens for link events for as long as the controller is alive.
fn spawn_supervisor(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(LinkEvent::ConnectionLost { generation, reason }) = event else {
                break;
            };
            let Some(shared) = shared.upgrade() else {
                break;
            };
            Controller { shared }.handle_lost(generation, reason).await;
        }
        tracing::debug!("reconnect supervisor stopped");
    });
}
