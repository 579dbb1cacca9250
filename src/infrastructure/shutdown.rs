use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Shutdown: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

/// Cancels the bridge's shutdown token. Hand this to a signal handler or
/// an admin surface; the bridge drains and stops when it fires.
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Shutdown for ShutdownManager {
    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}
