pub mod bridge;
pub mod bus_abstraction;
pub mod config;
pub mod dead_letter;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod shutdown;
pub mod storage_abstraction;
pub mod supervisor;
pub mod writer;

pub use bridge::BridgeController;
pub use bus_abstraction::{BusClient, BusError};
pub use config::{BridgeConfig, RetryConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore, InMemoryDeadLetterStore};
pub use logging::{init_logging, LoggingConfig};
pub use metrics::BridgeMetrics;
pub use shutdown::{Shutdown, ShutdownManager};
pub use queue::{EnqueueError, IngestionQueue};
pub use storage_abstraction::{StorageClient, StorageError, UpsertOutcome};
pub use supervisor::{ConnectionSupervisor, HealthSnapshot, LinkState};
pub use writer::{WriteCoordinator, WriteError, WriteReport};
