use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

use crate::domain::SensorRecord;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is full; the caller should apply backpressure upstream.
    #[error("ingestion queue is at capacity ({capacity})")]
    Overflow { capacity: usize },
    /// The queue was closed for shutdown; no new records are accepted.
    #[error("ingestion queue is closed")]
    Closed,
}

/// Bounded FIFO buffer decoupling message arrival from storage writes.
///
/// The sole synchronization point between the arrival path and the drain
/// loop: a mutex-guarded deque plus a `Notify` for wakeups. Overflow policy
/// is reject-new: a full queue refuses the enqueue so the caller can apply
/// backpressure upstream, and the loss is counted by the caller.
pub struct IngestionQueue {
    items: Mutex<VecDeque<SensorRecord>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl IngestionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Fast, non-blocking enqueue for the message-arrival path.
    ///
    /// The closed check happens under the same lock `close` takes, so once
    /// `close` returns no enqueue can slip a record past the shutdown drain.
    pub fn enqueue(&self, record: SensorRecord) -> Result<(), EnqueueError> {
        let mut items = self.items.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        if items.len() >= self.capacity {
            return Err(EnqueueError::Overflow {
                capacity: self.capacity,
            });
        }
        items.push_back(record);
        drop(items);
        self.notify.notify_one();
        Ok(())
    }

    /// Suspends until at least one record is available or `max_wait`
    /// elapses, then returns up to `max_n` records in enqueue order.
    pub async fn dequeue_batch(&self, max_n: usize, max_wait: Duration) -> Vec<SensorRecord> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut items = self.items.lock().unwrap();
                if !items.is_empty() {
                    return Self::drain(&mut items, max_n);
                }
                if self.closed.load(Ordering::Acquire) {
                    return Vec::new();
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let mut items = self.items.lock().unwrap();
                    return Self::drain(&mut items, max_n);
                }
            }
        }
    }

    /// Returns an unacknowledged batch to the head of the queue, preserving
    /// its internal order. May transiently exceed capacity: records already
    /// accepted are never dropped here.
    pub fn requeue_front(&self, records: Vec<SensorRecord>) {
        if records.is_empty() {
            return;
        }
        let mut items = self.items.lock().unwrap();
        for record in records.into_iter().rev() {
            items.push_front(record);
        }
        drop(items);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops new enqueues and blocking waits: later `enqueue` calls fail
    /// with `Closed` and `dequeue_batch` returns whatever is buffered
    /// without waiting. Used for shutdown drain.
    pub fn close(&self) {
        let items = self.items.lock().unwrap();
        self.closed.store(true, Ordering::Release);
        drop(items);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn drain(items: &mut VecDeque<SensorRecord>, max_n: usize) -> Vec<SensorRecord> {
        let take = max_n.min(items.len());
        items.drain(..take).collect()
    }
}
