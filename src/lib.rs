pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::{decode, RawMessage, RejectReason, RejectedMessage, SensorRecord, TopicPattern};
pub use infrastructure::{
    BridgeConfig, BridgeController, BridgeMetrics, BusClient, BusError, EnqueueError,
    IngestionQueue, LinkState, StorageClient, StorageError, UpsertOutcome, WriteError, WriteReport,
};
