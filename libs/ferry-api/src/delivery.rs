use tokio::sync::mpsc;

use crate::message::OverflowPolicy;
use crate::record::IncomingRecord;

/// The receiving side of the session has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryClosed;

impl std::fmt::Display for DeliveryClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery channel closed")
    }
}

impl std::error::Error for DeliveryClosed {}

/// Bounded record channel from a broker connection to the ingestion loop.
#[derive(Debug, Clone)]
pub struct DeliverySender {
    tx: mpsc::Sender<IncomingRecord>,
    overflow: OverflowPolicy,
}

impl DeliverySender {
    pub fn new(tx: mpsc::Sender<IncomingRecord>, overflow: OverflowPolicy) -> Self {
        Self { tx, overflow }
    }

    /// Hand one record over, honouring the overflow policy.
    ///
    /// With `Drop` a full channel loses the record and `Ok(false)` is
    /// returned so the caller can log it. `Err` means the session is over
    /// and the caller should stop reading from the broker.
    pub async fn deliver(&self, record: IncomingRecord) -> Result<bool, DeliveryClosed> {
        match self.overflow {
            OverflowPolicy::Drop => match self.tx.try_send(record) {
                Ok(()) => Ok(true),
                Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryClosed),
            },
            OverflowPolicy::BackPressure => {
                self.tx.send(record).await.map(|()| true).map_err(|_| DeliveryClosed)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Asynchronous connection-level notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The live session died (socket closed, broker went away, ...).
    ConnectionLost { generation: u64, reason: String },
}

/// Everything a connection needs to talk back to the engine for one session.
///
/// A new handle (with a new `generation`) is issued on every `connect`;
/// events carrying an older generation are ignored by the engine.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    records: DeliverySender,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: u64,
}

impl LinkHandle {
    pub fn new(
        records: DeliverySender,
        events: mpsc::UnboundedSender<LinkEvent>,
        generation: u64,
    ) -> Self {
        Self {
            records,
            events,
            generation,
        }
    }

    pub fn records(&self) -> &DeliverySender {
        &self.records
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the session is gone. Safe to call more than once.
    pub fn report_lost(&self, reason: impl Into<String>) {
        let _ = self.events.send(LinkEvent::ConnectionLost {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}
