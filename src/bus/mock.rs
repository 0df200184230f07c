//! Mock transport implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use super::{BusError, MessageListener, PubSubTransport, Result};

/// Mock transport that records publishes in memory.
#[derive(Default)]
pub struct MockTransport {
    published: RwLock<Vec<(String, String)>>,
    fail_on_publish: RwLock<bool>,
    fail_on_ping: RwLock<bool>,
    closed: RwLock<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose ping fails, as an unreachable server would.
    pub fn unreachable() -> Self {
        Self {
            fail_on_ping: RwLock::new(true),
            ..Default::default()
        }
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_ping(&self, fail: bool) {
        *self.fail_on_ping.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Recorded `(channel, payload)` pairs in publish order.
    pub async fn published(&self) -> Vec<(String, String)> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }
}

#[async_trait]
impl PubSubTransport for MockTransport {
    async fn ping(&self) -> Result<()> {
        if *self.fail_on_ping.read().await {
            return Err(BusError::Connection("Mock ping failure".to_string()));
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.published
            .write()
            .await
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn listen(
        &self,
        _channels: &[String],
        _listener: Arc<dyn MessageListener>,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        Err(BusError::SubscribeNotSupported)
    }

    async fn close(&self) {
        *self.closed.write().await = true;
    }
}
