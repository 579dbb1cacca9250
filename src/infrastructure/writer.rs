use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::domain::SensorRecord;
use crate::infrastructure::config::RetryConfig;
use crate::infrastructure::metrics::BridgeMetrics;
use crate::infrastructure::storage_abstraction::{StorageClient, StorageError, UpsertOutcome};

/// Terminal outcome counts for one acknowledged batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub inserted: u64,
    /// Upserts that hit an existing key, i.e. redelivered duplicates.
    pub updated: u64,
    /// Records the store rejected permanently; dropped, never retried.
    pub rejected: u64,
}

/// Transient storage failures are retried internally; the only error that
/// surfaces to the caller is retry exhaustion.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write retries exhausted after {attempts} attempts: {reason}")]
    Exhausted {
        attempts: u32,
        reason: String,
        /// Records that never got an acknowledgement, in their original
        /// order, for requeueing or the dead-letter path.
        unwritten: Vec<SensorRecord>,
    },
}

/// Drains batches into storage with idempotent upserts.
///
/// Every record gets a terminal outcome: acknowledged (inserted or
/// updated), permanently rejected, or returned as unwritten after retries
/// are exhausted. Nothing is silently dropped.
pub struct WriteCoordinator {
    storage: Arc<dyn StorageClient>,
    database: String,
    collection: String,
    retry: RetryConfig,
    write_timeout: Duration,
    metrics: Arc<BridgeMetrics>,
}

impl WriteCoordinator {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        database: impl Into<String>,
        collection: impl Into<String>,
        retry: RetryConfig,
        write_timeout: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            storage,
            database: database.into(),
            collection: collection.into(),
            retry,
            write_timeout,
            metrics,
        }
    }

    /// Upserts the batch, retrying the unwritten remainder with exponential
    /// backoff on transient failure. Permanent per-record rejections do not
    /// block the rest of the batch.
    pub async fn write_batch(
        &self,
        records: Vec<SensorRecord>,
    ) -> Result<WriteReport, WriteError> {
        let mut pending: VecDeque<SensorRecord> = records.into();
        let mut report = WriteReport::default();
        let mut attempts = 0u32;

        loop {
            match self.flush(&mut pending, &mut report).await {
                Ok(()) => {
                    BridgeMetrics::add(
                        &self.metrics.records_written,
                        report.inserted + report.updated,
                    );
                    debug!(
                        inserted = report.inserted,
                        updated = report.updated,
                        rejected = report.rejected,
                        "batch written"
                    );
                    return Ok(report);
                }
                Err(err) => {
                    attempts += 1;
                    BridgeMetrics::incr(&self.metrics.write_retries);
                    if attempts >= self.retry.max_attempts {
                        BridgeMetrics::incr(&self.metrics.write_exhausted);
                        BridgeMetrics::add(
                            &self.metrics.records_written,
                            report.inserted + report.updated,
                        );
                        error!(
                            attempts,
                            unwritten = pending.len(),
                            error = %err,
                            "write retries exhausted"
                        );
                        return Err(WriteError::Exhausted {
                            attempts,
                            reason: err.to_string(),
                            unwritten: pending.into(),
                        });
                    }

                    let delay = self.retry.delay_for(attempts);
                    warn!(
                        attempt = attempts,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient write failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Writes records until the batch is empty or a transient error stops
    /// progress. Acknowledged and permanently rejected records are removed
    /// from `pending`, so a retry resumes exactly where this stopped.
    async fn flush(
        &self,
        pending: &mut VecDeque<SensorRecord>,
        report: &mut WriteReport,
    ) -> Result<(), StorageError> {
        while let Some(record) = pending.front() {
            let key = record.document_key();
            let document = record.to_document();

            let ack = match timeout(
                self.write_timeout,
                self.storage
                    .upsert(&self.database, &self.collection, &key, &document),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    return Err(StorageError::Transient(format!(
                        "upsert timed out after {:?}",
                        self.write_timeout
                    )))
                }
            };

            match ack {
                Ok(UpsertOutcome::Inserted) => {
                    report.inserted += 1;
                }
                Ok(UpsertOutcome::Updated) => {
                    report.updated += 1;
                    BridgeMetrics::incr(&self.metrics.duplicates_updated);
                }
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    report.rejected += 1;
                    BridgeMetrics::incr(&self.metrics.permanent_rejections);
                    warn!(topic = %record.topic, key = %key, error = %err, "record permanently rejected by storage");
                }
            }
            pending.pop_front();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage_abstraction::MockStorageClient;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(topic: &str) -> SensorRecord {
        SensorRecord {
            topic: topic.to_string(),
            distance: Some(1.0),
            motion: None,
            lid_status: None,
            waste_level: None,
            timestamp: Utc::now(),
            source_seq: None,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
            max_attempts,
        }
    }

    fn coordinator(storage: MockStorageClient, retry: RetryConfig) -> WriteCoordinator {
        WriteCoordinator::new(
            Arc::new(storage),
            "garbage_data",
            "sensor_data",
            retry,
            Duration::from_secs(1),
            Arc::new(BridgeMetrics::default()),
        )
    }

    #[tokio::test]
    async fn reports_inserts_and_duplicate_updates() {
        let mut storage = MockStorageClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        storage
            .expect_upsert()
            .times(2)
            .returning(move |_, _, _, _| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(UpsertOutcome::Inserted)
                } else {
                    Ok(UpsertOutcome::Updated)
                }
            });

        let writer = coordinator(storage, fast_retry(3));
        let report = writer
            .write_batch(vec![record("a"), record("b")])
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.rejected, 0);
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let mut storage = MockStorageClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        storage
            .expect_upsert()
            .times(3)
            .returning(move |_, _, _, _| {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Transient("connection reset".to_string()))
                } else {
                    Ok(UpsertOutcome::Inserted)
                }
            });

        let writer = coordinator(storage, fast_retry(5));
        let report = writer.write_batch(vec![record("a")]).await.unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(
            BridgeMetrics::get(&writer.metrics.write_retries),
            2,
            "both transient failures should count as retries"
        );
    }

    #[tokio::test]
    async fn exhausted_returns_unwritten_records() {
        let mut storage = MockStorageClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        storage.expect_upsert().returning(move |_, _, _, _| {
            // First record lands, everything after fails.
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(UpsertOutcome::Inserted)
            } else {
                Err(StorageError::Transient("timeout".to_string()))
            }
        });

        let writer = coordinator(storage, fast_retry(2));
        let err = writer
            .write_batch(vec![record("a"), record("b"), record("c")])
            .await
            .unwrap_err();

        let WriteError::Exhausted {
            attempts,
            unwritten,
            ..
        } = err;
        assert_eq!(attempts, 2);
        let topics: Vec<_> = unwritten.iter().map(|r| r.topic.as_str()).collect();
        assert_eq!(topics, ["b", "c"], "unwritten tail keeps its order");
        assert_eq!(BridgeMetrics::get(&writer.metrics.write_exhausted), 1);
    }

    #[tokio::test]
    async fn permanent_rejection_does_not_block_the_batch() {
        let mut storage = MockStorageClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        storage
            .expect_upsert()
            .times(3)
            .returning(move |_, _, _, _| {
                if seen.fetch_add(1, Ordering::SeqCst) == 1 {
                    Err(StorageError::Permanent("schema rejection".to_string()))
                } else {
                    Ok(UpsertOutcome::Inserted)
                }
            });

        let writer = coordinator(storage, fast_retry(3));
        let report = writer
            .write_batch(vec![record("a"), record("b"), record("c")])
            .await
            .unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(BridgeMetrics::get(&writer.metrics.permanent_rejections), 1);
    }

    #[tokio::test]
    async fn upsert_key_is_stable_for_redelivery() {
        let mut storage = MockStorageClient::new();
        let keys = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = keys.clone();
        storage
            .expect_upsert()
            .times(2)
            .returning(move |_, _, key, _| {
                seen.lock().unwrap().push(key.to_string());
                Ok(UpsertOutcome::Inserted)
            });

        let message = record("garbage/bin7");
        let writer = coordinator(storage, fast_retry(3));
        writer
            .write_batch(vec![message.clone(), message])
            .await
            .unwrap();

        let keys = keys.lock().unwrap();
        assert_eq!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn writes_target_the_configured_database_and_collection() {
        let mut storage = MockStorageClient::new();
        let targets = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = targets.clone();
        storage
            .expect_upsert()
            .times(1)
            .returning(move |database, collection, _, _| {
                seen.lock()
                    .unwrap()
                    .push((database.to_string(), collection.to_string()));
                Ok(UpsertOutcome::Inserted)
            });

        let writer = coordinator(storage, fast_retry(3));
        writer.write_batch(vec![record("garbage/bin7")]).await.unwrap();

        let targets = targets.lock().unwrap();
        assert_eq!(
            targets.as_slice(),
            [("garbage_data".to_string(), "sensor_data".to_string())]
        );
    }
}
