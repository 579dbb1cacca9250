use async_trait::async_trait;
use thiserror::Error;

/// What an acknowledged upsert did to the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The key already existed; the document was overwritten. Seen on
    /// redelivery of the same logical message.
    Updated,
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection reset, timeout, leader election: worth retrying.
    #[error("transient storage error: {0}")]
    Transient(String),
    /// Schema rejection or similar: retrying cannot succeed.
    #[error("permanent storage rejection: {0}")]
    Permanent(String),
    #[error("storage connection error: {0}")]
    Connection(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Connection(_))
    }
}

/// Collaborator seam for the document store. The bridge only needs
/// acknowledged, idempotent upserts classified transient vs permanent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;

    async fn disconnect(&self) -> Result<(), StorageError>;

    /// Insert-or-overwrite `document` under `key` in the named database and
    /// collection. Repeating the call with the same key must leave the same
    /// stored state.
    async fn upsert(
        &self,
        database: &str,
        collection: &str,
        key: &str,
        document: &serde_json::Value,
    ) -> Result<UpsertOutcome, StorageError>;

    /// Cheap liveness probe used by the supervisor for fault detection.
    fn is_connected(&self) -> bool;
}
