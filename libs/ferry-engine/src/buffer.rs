use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::record::Record;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_READ_LIMIT: usize = 10;

// ═══════════════════════════════════════════════════════════════
//  RecordBuffer
// ═══════════════════════════════════════════════════════════════

/// Fixed-capacity FIFO of ingested records. When full, the oldest record
/// is evicted before the new one goes in.
///
/// Readers take a shared lock only to clone the `Arc`s out; filtering
/// happens after the lock is released, so `append` never waits on it.
pub struct RecordBuffer {
    records: RwLock<VecDeque<Arc<Record>>>,
    capacity: usize,
    default_limit: usize,
    appended: AtomicU64,
    evicted: AtomicU64,
}

/// Counters reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub appended: u64,
    pub evicted: u64,
}

impl RecordBuffer {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(65536))),
            capacity,
            default_limit: DEFAULT_READ_LIMIT,
            appended: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    pub fn append(&self, record: Record) {
        let record = Arc::new(record);
        let mut buf = self.write();
        if buf.len() >= self.capacity {
            buf.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        buf.push_back(record);
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    /// The most recent `limit` records accepted by `predicate`, oldest first.
    ///
    /// `None` or `0` means the default read limit.
    pub fn snapshot<F>(&self, limit: Option<usize>, predicate: F) -> Vec<Arc<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        let limit = match limit {
            Some(n) if n > 0 => n,
            _ => self.default_limit,
        };

        // Only the Arc clones happen under the lock; the predicate runs after.
        let all: Vec<Arc<Record>> = self.read().iter().cloned().collect();

        let mut out: Vec<Arc<Record>> = all
            .into_iter()
            .rev()
            .filter(|r| predicate(r))
            .take(limit)
            .collect();
        out.reverse();
        out
    }

    /// Empty the buffer, returning how many records it held.
    pub fn clear(&self) -> usize {
        let mut buf = self.write();
        let n = buf.len();
        buf.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    pub fn stats(&self) -> BufferStats {
        let len = self.len();
        BufferStats {
            len,
            capacity: self.capacity,
            appended: self.appended.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    // ---------------------------------------------------------------------------

    fn read(&self) -> RwLockReadGuard<'_, VecDeque<Arc<Record>>> {
        match self.records.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("record buffer read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, VecDeque<Arc<Record>>> {
        match self.records.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("record buffer write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ferry_api::record::IncomingRecord;

    use super::*;

    fn record(topic: &str, payload: &str) -> Record {
        Record::normalize(IncomingRecord::new(topic, payload), Utc::now()).unwrap()
    }

    fn payloads(records: &[Arc<Record>]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.payload.as_text().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn oldest_record_is_evicted_first() {
        let buffer = RecordBuffer::new(3);
        for p in ["A", "B", "C", "D"] {
            buffer.append(record("t", p));
        }

        assert_eq!(payloads(&buffer.snapshot(Some(10), |_| true)), ["B", "C", "D"]);
        let stats = buffer.stats();
        assert_eq!(stats.len, 3);
        assert_eq!(stats.appended, 4);
        assert_eq!(stats.evicted, 1);
    }

    #[test]
    fn snapshot_keeps_most_recent_in_chronological_order() {
        let buffer = RecordBuffer::new(100);
        for i in 0..20 {
            buffer.append(record("t", &i.to_string()));
        }

        assert_eq!(payloads(&buffer.snapshot(Some(3), |_| true)), ["17", "18", "19"]);
    }

    #[test]
    fn zero_or_missing_limit_uses_default() {
        let buffer = RecordBuffer::new(100).with_default_limit(4);
        for i in 0..10 {
            buffer.append(record("t", &i.to_string()));
        }

        assert_eq!(buffer.snapshot(None, |_| true).len(), 4);
        assert_eq!(buffer.snapshot(Some(0), |_| true).len(), 4);
    }

    #[test]
    fn clear_returns_prior_count() {
        let buffer = RecordBuffer::new(10);
        buffer.append(record("t", "x"));
        buffer.append(record("t", "y"));

        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.clear(), 0);
    }
}
