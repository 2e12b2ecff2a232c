use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ferry_api::record::IncomingRecord;

use crate::buffer::RecordBuffer;
use crate::record::Record;

#[derive(Debug, Default)]
pub(crate) struct IngestCounters {
    pub received: AtomicU64,
    pub dropped: AtomicU64,
}

/// Spawn the ingestion loop.
///
/// The loop moves records from the session channel into the buffer until
/// `token` is cancelled or every sender is gone. On cancellation it drains
/// what is already queued, then hands the receiver back through the join
/// handle so the same session can be resumed later.
pub(crate) fn spawn_ingestion(
    transport: String,
    mut rx: mpsc::Receiver<IncomingRecord>,
    buffer: Arc<RecordBuffer>,
    counters: Arc<IngestCounters>,
    token: CancellationToken,
) -> JoinHandle<mpsc::Receiver<IncomingRecord>> {
    tokio::spawn(async move {
        tracing::debug!(transport = %transport, "ingestion loop started");

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    // --- finish what the broker already delivered
                    while let Ok(incoming) = rx.try_recv() {
                        store(&transport, incoming, &buffer, &counters);
                    }
                    break;
                }

                incoming = rx.recv() => match incoming {
                    Some(incoming) => store(&transport, incoming, &buffer, &counters),
                    None => {
                        tracing::debug!(transport = %transport, "delivery channel closed");
                        break;
                    }
                },
            }
        }

        tracing::debug!(transport = %transport, "ingestion loop stopped");
        rx
    })
}

fn store(transport: &str, incoming: IncomingRecord, buffer: &RecordBuffer, counters: &IngestCounters) {
    counters.received.fetch_add(1, Ordering::Relaxed);
    let topic = incoming.topic.clone();
    match Record::normalize(incoming, Utc::now()) {
        Ok(record) => {
            tracing::debug!(transport, topic = %topic, "record received");
            buffer.append(record);
        }
        Err(e) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(transport, topic = %topic, error = %e, "dropping malformed record");
        }
    }
}
