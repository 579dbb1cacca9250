use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the whole ingestion path, exposed for external scraping.
/// Shared as `Arc<BridgeMetrics>`; all updates are relaxed atomics.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    // Arrival path
    pub messages_received: AtomicU64,
    pub messages_decoded: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub records_enqueued: AtomicU64,
    pub queue_overflows: AtomicU64,

    // Write path
    pub records_written: AtomicU64,
    pub duplicates_updated: AtomicU64,
    pub permanent_rejections: AtomicU64,
    pub write_retries: AtomicU64,
    pub write_exhausted: AtomicU64,

    // Dead-letter path
    pub dead_letter_entries: AtomicU64,
    pub dead_letter_replayed: AtomicU64,
    pub dead_letter_dropped: AtomicU64,

    // Links
    pub bus_connects: AtomicU64,
    pub storage_connects: AtomicU64,
}

impl BridgeMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Share of received messages that failed decoding.
    pub fn reject_rate(&self) -> f64 {
        let received = self.messages_received.load(Ordering::Relaxed);
        if received == 0 {
            return 0.0;
        }
        self.messages_rejected.load(Ordering::Relaxed) as f64 / received as f64
    }

    /// Share of enqueued records that reached storage.
    pub fn write_success_rate(&self) -> f64 {
        let enqueued = self.records_enqueued.load(Ordering::Relaxed);
        if enqueued == 0 {
            return 0.0;
        }
        self.records_written.load(Ordering::Relaxed) as f64 / enqueued as f64
    }
}
