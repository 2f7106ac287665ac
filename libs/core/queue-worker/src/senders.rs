//! Per-destination sender cache
//!
//! Senders are created lazily on first use and shared by every handler afterwards.

use crate::broker::{MessageSender, SenderFactory};
use crate::envelope::OutgoingMessage;
use crate::error::WorkerError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Thread-safe, lazily populated map of destination name to sender
pub struct SenderCache {
    factory: Arc<dyn SenderFactory>,
    senders: RwLock<HashMap<String, Arc<dyn MessageSender>>>,
}

impl SenderCache {
    pub fn new(factory: Arc<dyn SenderFactory>) -> Self {
        Self {
            factory,
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Get the sender for `destination`, creating it if this is the first request.
    ///
    /// Concurrent first callers for the same destination create exactly one sender.
    pub async fn sender(&self, destination: &str) -> Result<Arc<dyn MessageSender>, WorkerError> {
        if let Some(sender) = self.senders.read().await.get(destination) {
            return Ok(sender.clone());
        }

        let mut senders = self.senders.write().await;
        if let Some(sender) = senders.get(destination) {
            return Ok(sender.clone());
        }

        let sender = self.factory.create_sender(destination).await?;
        senders.insert(destination.to_string(), sender.clone());
        debug!(destination = %destination, "Created message sender");

        Ok(sender)
    }

    /// Send through the cached sender for `destination`
    pub async fn send(&self, destination: &str, message: OutgoingMessage) -> Result<(), WorkerError> {
        self.sender(destination).await?.send(message).await
    }

    pub async fn len(&self) -> usize {
        self.senders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.senders.read().await.is_empty()
    }
}
