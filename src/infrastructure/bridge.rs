use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{decode, RawMessage, SensorRecord};
use crate::infrastructure::bus_abstraction::BusClient;
use crate::infrastructure::config::BridgeConfig;
use crate::infrastructure::dead_letter::{DeadLetterEntry, DeadLetterStore, InMemoryDeadLetterStore};
use crate::infrastructure::metrics::BridgeMetrics;
use crate::infrastructure::queue::{EnqueueError, IngestionQueue};
use crate::infrastructure::storage_abstraction::StorageClient;
use crate::infrastructure::supervisor::{ConnectionSupervisor, HealthSnapshot, LinkState};
use crate::infrastructure::writer::{WriteCoordinator, WriteError};

/// Wires decoder, queue, writer and supervisor into the running service.
///
/// Owns no state beyond the wiring. The arrival path (`ingest`) is
/// synchronous and fast: decode plus enqueue, nothing else. A single
/// background drain task moves records from the queue into storage. The two
/// paths share only the queue.
pub struct BridgeController {
    config: BridgeConfig,
    bus: Arc<dyn BusClient>,
    queue: Arc<IngestionQueue>,
    writer: Arc<WriteCoordinator>,
    supervisor: Arc<ConnectionSupervisor>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<BridgeMetrics>,
    cancel: CancellationToken,
}

impl BridgeController {
    pub fn new(
        config: BridgeConfig,
        bus: Arc<dyn BusClient>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        let metrics = Arc::new(BridgeMetrics::default());
        let cancel = CancellationToken::new();
        let queue = Arc::new(IngestionQueue::new(config.queue_capacity));
        let writer = Arc::new(WriteCoordinator::new(
            Arc::clone(&storage),
            config.database.clone(),
            config.collection.clone(),
            config.retry.clone(),
            config.write_timeout,
            Arc::clone(&metrics),
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&bus),
            storage,
            &config,
            Arc::clone(&metrics),
            cancel.clone(),
        ));
        let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(InMemoryDeadLetterStore::new(
            config.dead_letter_capacity,
            Arc::clone(&metrics),
        ));

        Self {
            config,
            bus,
            queue,
            writer,
            supervisor,
            dead_letters,
            metrics,
            cancel,
        }
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn health(&self) -> HealthSnapshot {
        self.supervisor.health()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub async fn dead_letter_backlog(&self) -> usize {
        self.dead_letters.len().await
    }

    /// Token that stops intake and triggers the shutdown drain when
    /// cancelled. Clone and hand to a signal handler.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Message-arrival fast path: decode and enqueue, never blocks.
    ///
    /// A full queue rejects the record and counts the overflow; that is the
    /// backpressure signal, not a silent drop. Once shutdown is signaled the
    /// path refuses new messages so the final drain sees a settled queue.
    pub fn ingest(&self, message: RawMessage) {
        if self.cancel.is_cancelled() {
            warn!(topic = %message.topic, "shutdown in progress, refusing new message");
            return;
        }
        BridgeMetrics::incr(&self.metrics.messages_received);

        match decode(&message.topic, &message.payload, message.received_at) {
            Ok(record) => {
                BridgeMetrics::incr(&self.metrics.messages_decoded);
                match self.queue.enqueue(record) {
                    Ok(()) => BridgeMetrics::incr(&self.metrics.records_enqueued),
                    Err(EnqueueError::Overflow { capacity }) => {
                        BridgeMetrics::incr(&self.metrics.queue_overflows);
                        warn!(
                            topic = %message.topic,
                            capacity,
                            "ingestion queue full, rejecting record"
                        );
                    }
                    Err(EnqueueError::Closed) => {
                        warn!(topic = %message.topic, "queue closed for shutdown, refusing record");
                    }
                }
            }
            Err(rejection) => {
                BridgeMetrics::incr(&self.metrics.messages_rejected);
                warn!(
                    topic = %rejection.topic,
                    reason = %rejection.reason,
                    "message rejected at decode"
                );
            }
        }
    }

    /// Runs the bridge until the shutdown handle is cancelled, then drains
    /// what remains in the queue with a final bounded write attempt.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            bus = %self.config.bus_url,
            storage = %self.config.storage_url,
            pattern = %self.config.topic_pattern,
            "starting telemetry bridge"
        );

        let supervisor_handles = Arc::clone(&self.supervisor).spawn();
        let mut drain = tokio::spawn(Arc::clone(&self).drain_loop());
        let intake = tokio::spawn(Arc::clone(&self).intake_loop());

        self.cancel.cancelled().await;
        info!("shutdown signaled, draining remaining records");

        intake.await?;
        match timeout(self.config.shutdown_drain_timeout, &mut drain).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!(
                    queued = self.queue.len(),
                    "shutdown drain timed out, abandoning remaining records"
                );
                drain.abort();
            }
        }
        for joined in futures::future::join_all(supervisor_handles).await {
            joined?;
        }

        info!("telemetry bridge stopped");
        Ok(())
    }

    /// Pulls messages from the bus while its link is up. While the link is
    /// down nothing arrives, so the loop parks on the state channel.
    async fn intake_loop(self: Arc<Self>) {
        let mut bus_state = self.supervisor.bus_state();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            if *bus_state.borrow_and_update() != LinkState::Connected {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = bus_state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                polled = self.bus.next_message(self.config.batch_max_wait) => match polled {
                    Ok(Some(message)) => self.ingest(message),
                    Ok(None) => {}
                    Err(err) => {
                        // The supervisor's probe decides whether this is a
                        // link fault; here we just avoid a hot error loop.
                        warn!(error = %err, "bus poll failed");
                        tokio::time::sleep(self.config.health_probe_interval).await;
                    }
                }
            }
        }
    }

    /// The single long-lived consumer: dequeue a batch, wait out storage
    /// outages (the queue keeps buffering), write, dead-letter on
    /// exhaustion, and replay dead letters once storage recovers.
    async fn drain_loop(self: Arc<Self>) {
        let mut storage_state = self.supervisor.storage_state();
        while !self.cancel.is_cancelled() {
            if *storage_state.borrow_and_update() == LinkState::Connected {
                self.replay_dead_letters().await;
            }

            let batch = self
                .queue
                .dequeue_batch(self.config.batch_max_size, self.config.batch_max_wait)
                .await;
            if batch.is_empty() {
                continue;
            }

            if !self.wait_for_storage(&mut storage_state).await {
                self.queue.requeue_front(batch);
                break;
            }

            // Anything dead-lettered during the outage is older than this
            // batch, so it goes first.
            self.replay_dead_letters().await;
            self.write_or_dead_letter(batch).await;
        }

        self.final_drain().await;
    }

    /// Suspends until the storage link is Connected. Returns false if
    /// cancellation fired first.
    async fn wait_for_storage(&self, state: &mut watch::Receiver<LinkState>) -> bool {
        while *state.borrow_and_update() != LinkState::Connected {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn write_or_dead_letter(&self, batch: Vec<SensorRecord>) {
        match self.writer.write_batch(batch).await {
            Ok(_) => {}
            Err(WriteError::Exhausted {
                attempts,
                reason,
                unwritten,
            }) => {
                error!(
                    attempts,
                    records = unwritten.len(),
                    reason = %reason,
                    "write retries exhausted, moving batch to dead-letter store"
                );
                self.dead_letters
                    .push(DeadLetterEntry::new(unwritten, reason))
                    .await;
            }
        }
    }

    /// Replays dead-letter entries ahead of new traffic. Stops at the first
    /// renewed exhaustion: storage is down again and the rest can wait.
    async fn replay_dead_letters(&self) {
        let entries = self.dead_letters.drain().await;
        for mut entry in entries {
            let total = entry.records.len() as u64;
            match self
                .writer
                .write_batch(std::mem::take(&mut entry.records))
                .await
            {
                Ok(_) => {
                    BridgeMetrics::add(&self.metrics.dead_letter_replayed, total);
                    info!(entry_id = %entry.id, records = total, "dead-letter entry replayed");
                }
                Err(WriteError::Exhausted {
                    reason, unwritten, ..
                }) => {
                    let written = total - unwritten.len() as u64;
                    BridgeMetrics::add(&self.metrics.dead_letter_replayed, written);
                    entry.retry_count += 1;
                    entry.failure_reason = reason;
                    entry.records = unwritten;
                    warn!(
                        entry_id = %entry.id,
                        retry_count = entry.retry_count,
                        "dead-letter replay failed, entry kept for the next recovery"
                    );
                    self.dead_letters.push(entry).await;
                    return;
                }
            }
        }
    }

    /// Shutdown drain: close the queue, then flush whatever is buffered.
    /// The caller bounds this with `shutdown_drain_timeout`.
    async fn final_drain(&self) {
        self.queue.close();
        loop {
            let batch = self
                .queue
                .dequeue_batch(self.config.batch_max_size, Duration::ZERO)
                .await;
            if batch.is_empty() {
                break;
            }

            if self.supervisor.health().storage == LinkState::Connected {
                self.write_or_dead_letter(batch).await;
            } else {
                warn!(
                    records = batch.len(),
                    "storage link down during shutdown drain, dead-lettering records"
                );
                self.dead_letters
                    .push(DeadLetterEntry::new(
                        batch,
                        "storage disconnected at shutdown",
                    ))
                    .await;
            }
        }
    }
}
