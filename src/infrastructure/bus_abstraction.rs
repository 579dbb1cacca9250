use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{RawMessage, TopicPattern};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),
    #[error("bus subscription error: {0}")]
    Subscription(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

/// Collaborator seam for the message bus. The bridge never speaks the bus
/// protocol itself; a concrete client (MQTT, Kafka, ...) implements this
/// trait and owns the wire details.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn connect(&self) -> Result<(), BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;

    /// Subscribes to a hierarchical topic filter. Only valid once connected.
    async fn subscribe(&self, pattern: &TopicPattern) -> Result<(), BusError>;

    /// Waits up to `max_wait` for the next inbound message. `Ok(None)`
    /// means the wait elapsed without traffic, not a fault.
    async fn next_message(&self, max_wait: Duration) -> Result<Option<RawMessage>, BusError>;

    /// Cheap liveness probe used by the supervisor for fault detection.
    fn is_connected(&self) -> bool;
}
