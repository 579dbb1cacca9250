use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::TopicPattern;
use crate::infrastructure::bus_abstraction::BusClient;
use crate::infrastructure::config::{BridgeConfig, RetryConfig};
use crate::infrastructure::metrics::BridgeMetrics;
use crate::infrastructure::storage_abstraction::StorageClient;

/// Lifecycle state of one link. Both links cycle
/// `Disconnected -> Connecting -> Connected -> Disconnected` independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => f.write_str("disconnected"),
            LinkState::Connecting => f.write_str("connecting"),
            LinkState::Connected => f.write_str("connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub bus: LinkState,
    pub storage: LinkState,
}

impl HealthSnapshot {
    pub fn healthy(&self) -> bool {
        self.bus == LinkState::Connected && self.storage == LinkState::Connected
    }
}

/// Owns both connection handles and drives their reconnection.
///
/// One background task per link: connect with a timeout, back off
/// exponentially on failure (independent counters), probe liveness while
/// connected, and publish every state change on a watch channel so the
/// intake and drain loops can pause and resume. Link faults never escape
/// as errors; the only way out of the loops is cancellation.
pub struct ConnectionSupervisor {
    bus: Arc<dyn BusClient>,
    storage: Arc<dyn StorageClient>,
    topic_pattern: TopicPattern,
    connect_timeout: Duration,
    probe_interval: Duration,
    retry: RetryConfig,
    bus_tx: watch::Sender<LinkState>,
    storage_tx: watch::Sender<LinkState>,
    metrics: Arc<BridgeMetrics>,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        bus: Arc<dyn BusClient>,
        storage: Arc<dyn StorageClient>,
        config: &BridgeConfig,
        metrics: Arc<BridgeMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (bus_tx, _) = watch::channel(LinkState::Disconnected);
        let (storage_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            bus,
            storage,
            topic_pattern: config.topic_pattern.clone(),
            connect_timeout: config.connect_timeout,
            probe_interval: config.health_probe_interval,
            retry: config.retry.clone(),
            bus_tx,
            storage_tx,
            metrics,
            cancel,
        }
    }

    pub fn bus_state(&self) -> watch::Receiver<LinkState> {
        self.bus_tx.subscribe()
    }

    pub fn storage_state(&self) -> watch::Receiver<LinkState> {
        self.storage_tx.subscribe()
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            bus: *self.bus_tx.borrow(),
            storage: *self.storage_tx.borrow(),
        }
    }

    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self).bus_link_loop()),
            tokio::spawn(self.storage_link_loop()),
        ]
    }

    async fn bus_link_loop(self: Arc<Self>) {
        let mut attempt = 0u32;
        while !self.cancel.is_cancelled() {
            self.publish(&self.bus_tx, LinkState::Connecting);
            match self.connect_bus().await {
                Ok(()) => {
                    attempt = 0;
                    BridgeMetrics::incr(&self.metrics.bus_connects);
                    self.publish(&self.bus_tx, LinkState::Connected);
                    info!(pattern = %self.topic_pattern, "bus link connected and subscribed");

                    self.monitor(|| self.bus.is_connected()).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!("bus link fault detected");
                    self.publish(&self.bus_tx, LinkState::Disconnected);
                }
                Err(err) => {
                    self.publish(&self.bus_tx, LinkState::Disconnected);
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "bus connect failed, scheduling retry"
                    );
                    self.sleep_or_cancel(delay).await;
                }
            }
        }

        if let Err(err) = self.bus.disconnect().await {
            warn!(error = %err, "bus disconnect on shutdown failed");
        }
        self.publish(&self.bus_tx, LinkState::Disconnected);
    }

    async fn storage_link_loop(self: Arc<Self>) {
        let mut attempt = 0u32;
        while !self.cancel.is_cancelled() {
            self.publish(&self.storage_tx, LinkState::Connecting);
            match self.connect_storage().await {
                Ok(()) => {
                    attempt = 0;
                    BridgeMetrics::incr(&self.metrics.storage_connects);
                    self.publish(&self.storage_tx, LinkState::Connected);
                    info!("storage link connected");

                    self.monitor(|| self.storage.is_connected()).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!("storage link fault detected");
                    self.publish(&self.storage_tx, LinkState::Disconnected);
                }
                Err(err) => {
                    self.publish(&self.storage_tx, LinkState::Disconnected);
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "storage connect failed, scheduling retry"
                    );
                    self.sleep_or_cancel(delay).await;
                }
            }
        }

        if let Err(err) = self.storage.disconnect().await {
            warn!(error = %err, "storage disconnect on shutdown failed");
        }
        self.publish(&self.storage_tx, LinkState::Disconnected);
    }

    async fn connect_bus(&self) -> Result<()> {
        timeout(self.connect_timeout, self.bus.connect())
            .await
            .map_err(|_| anyhow!("bus connect timed out after {:?}", self.connect_timeout))??;
        timeout(self.connect_timeout, self.bus.subscribe(&self.topic_pattern))
            .await
            .map_err(|_| anyhow!("bus subscribe timed out after {:?}", self.connect_timeout))??;
        Ok(())
    }

    async fn connect_storage(&self) -> Result<()> {
        timeout(self.connect_timeout, self.storage.connect())
            .await
            .map_err(|_| {
                anyhow!("storage connect timed out after {:?}", self.connect_timeout)
            })??;
        Ok(())
    }

    /// Returns when the probe reports the link dead or cancellation fires.
    async fn monitor<F: Fn() -> bool>(&self, alive: F) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.probe_interval) => {
                    if !alive() {
                        return;
                    }
                }
            }
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn publish(&self, tx: &watch::Sender<LinkState>, state: LinkState) {
        // send_if_modified keeps spurious wakeups away from the watchers.
        tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawMessage;
    use crate::infrastructure::bus_abstraction::BusError;
    use crate::infrastructure::storage_abstraction::{StorageError, UpsertOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FlakyBus {
        failures_remaining: AtomicU32,
        alive: AtomicBool,
    }

    impl FlakyBus {
        fn new(failures: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(failures),
                alive: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl BusClient for FlakyBus {
        async fn connect(&self) -> Result<(), BusError> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BusError::Connection("refused".to_string()));
            }
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), BusError> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn subscribe(&self, _pattern: &TopicPattern) -> Result<(), BusError> {
            Ok(())
        }

        async fn next_message(
            &self,
            max_wait: Duration,
        ) -> Result<Option<RawMessage>, BusError> {
            tokio::time::sleep(max_wait).await;
            Ok(None)
        }

        fn is_connected(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct SteadyStorage {
        alive: AtomicBool,
    }

    #[async_trait]
    impl StorageClient for SteadyStorage {
        async fn connect(&self) -> Result<(), StorageError> {
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), StorageError> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn upsert(
            &self,
            _database: &str,
            _collection: &str,
            _key: &str,
            _document: &serde_json::Value,
        ) -> Result<UpsertOutcome, StorageError> {
            Ok(UpsertOutcome::Inserted)
        }

        fn is_connected(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn fast_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.connect_timeout = Duration::from_millis(100);
        config.health_probe_interval = Duration::from_millis(5);
        config.retry.base_delay = Duration::from_millis(2);
        config.retry.max_delay = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn connects_after_repeated_failures() {
        let bus = Arc::new(FlakyBus::new(3));
        let storage = Arc::new(SteadyStorage {
            alive: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            bus,
            storage,
            &fast_config(),
            Arc::new(BridgeMetrics::default()),
            cancel.clone(),
        ));

        let mut bus_state = supervisor.bus_state();
        let handles = supervisor.clone().spawn();

        timeout(
            Duration::from_secs(2),
            bus_state.wait_for(|s| *s == LinkState::Connected),
        )
        .await
        .expect("bus link should eventually connect")
        .unwrap();

        assert!(supervisor.health().bus == LinkState::Connected);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn detects_fault_and_reconnects() {
        let bus = Arc::new(FlakyBus::new(0));
        let storage = Arc::new(SteadyStorage {
            alive: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();
        let metrics = Arc::new(BridgeMetrics::default());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            bus.clone(),
            storage,
            &fast_config(),
            metrics.clone(),
            cancel.clone(),
        ));

        let mut bus_state = supervisor.bus_state();
        let handles = supervisor.clone().spawn();

        timeout(
            Duration::from_secs(2),
            bus_state.wait_for(|s| *s == LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        // Simulated transport fault; the probe should notice and reconnect.
        // The watch channel only keeps the latest value, so observe the
        // reconnect through the connect counter instead of the transitions.
        bus.alive.store(false, Ordering::SeqCst);

        timeout(Duration::from_secs(2), async {
            while BridgeMetrics::get(&metrics.bus_connects) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("supervisor should reconnect after a fault");

        timeout(
            Duration::from_secs(2),
            bus_state.wait_for(|s| *s == LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn health_degrades_while_disconnected() {
        let bus = Arc::new(FlakyBus::new(u32::MAX));
        let storage = Arc::new(SteadyStorage {
            alive: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            bus,
            storage,
            &fast_config(),
            Arc::new(BridgeMetrics::default()),
            cancel.clone(),
        ));

        let handles = supervisor.clone().spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!supervisor.health().healthy());

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
