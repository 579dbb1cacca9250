use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::domain::SensorRecord;
use crate::infrastructure::metrics::BridgeMetrics;

/// A batch that exhausted its write retries, preserved for replay once the
/// storage link recovers (or for manual inspection).
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub records: Vec<SensorRecord>,
    pub failure_reason: String,
    pub first_failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl DeadLetterEntry {
    pub fn new(records: Vec<SensorRecord>, failure_reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            records,
            failure_reason: failure_reason.into(),
            first_failed_at: Utc::now(),
            retry_count: 0,
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn push(&self, entry: DeadLetterEntry);

    /// Removes and returns all entries, oldest first.
    async fn drain(&self) -> Vec<DeadLetterEntry>;

    async fn len(&self) -> usize;
}

/// Bounded in-memory dead-letter store. Beyond capacity the oldest entry is
/// evicted with a counted loss; records here were already unwritable, so an
/// unbounded buffer would just defer the failure to memory.
pub struct InMemoryDeadLetterStore {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
    metrics: Arc<BridgeMetrics>,
}

impl InMemoryDeadLetterStore {
    pub fn new(capacity: usize, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            metrics,
        }
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn push(&self, entry: DeadLetterEntry) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                BridgeMetrics::incr(&self.metrics.dead_letter_dropped);
                warn!(
                    entry_id = %evicted.id,
                    records = evicted.records.len(),
                    "dead-letter store full, evicting oldest entry"
                );
            }
        }
        BridgeMetrics::incr(&self.metrics.dead_letter_entries);
        entries.push_back(entry);
    }

    async fn drain(&self) -> Vec<DeadLetterEntry> {
        let mut entries = self.entries.lock().await;
        entries.drain(..).collect()
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(topic: &str) -> DeadLetterEntry {
        DeadLetterEntry::new(
            vec![SensorRecord {
                topic: topic.to_string(),
                distance: None,
                motion: None,
                lid_status: None,
                waste_level: None,
                timestamp: Utc::now(),
                source_seq: None,
            }],
            "storage unreachable",
        )
    }

    #[tokio::test]
    async fn drain_returns_entries_oldest_first() {
        let store =
            InMemoryDeadLetterStore::new(10, Arc::new(BridgeMetrics::default()));
        store.push(entry("a")).await;
        store.push(entry("b")).await;

        let drained = store.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].records[0].topic, "a");
        assert_eq!(drained[1].records[0].topic, "b");
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_capacity() {
        let metrics = Arc::new(BridgeMetrics::default());
        let store = InMemoryDeadLetterStore::new(2, metrics.clone());
        store.push(entry("a")).await;
        store.push(entry("b")).await;
        store.push(entry("c")).await;

        let drained = store.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].records[0].topic, "b");
        assert_eq!(BridgeMetrics::get(&metrics.dead_letter_dropped), 1);
    }
}
