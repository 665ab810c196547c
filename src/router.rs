//! Topic routing.
//!
//! Outbound, a topic resolves to the enabled remotes subscribed to it.
//! Inbound, a topic resolves to exactly one local handler.

use crate::error::{RemoteClusterError, Result};
use crate::metrics::MetricsSink;
use crate::model::{normalize_topic, RemoteCluster};
use crate::registry::RemoteClusterRegistry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback for payloads received from a remote: `(remote_id, payload)`.
pub type InboundHandler = Arc<dyn Fn(&str, &[u8]) -> Result<()> + Send + Sync>;

/// Maps topics to subscribed remotes and to inbound handlers.
pub struct TopicRouter {
    registry: Arc<RemoteClusterRegistry>,
    handlers: RwLock<HashMap<String, InboundHandler>>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        f.debug_struct("TopicRouter").field("handlers", &topics).finish()
    }
}

impl TopicRouter {
    pub fn new(registry: Arc<RemoteClusterRegistry>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Enabled remotes subscribed to `topic`. Always read fresh.
    pub async fn remotes_for_topic(&self, topic: &str) -> Result<Vec<RemoteCluster>> {
        self.registry.get_by_topic(topic).await
    }

    /// Install the inbound handler for `topic`.
    ///
    /// Fails with `Conflict` if one is already installed; the existing
    /// handler stays active.
    pub fn register_handler<F>(&self, topic: &str, handler: F) -> Result<()>
    where
        F: Fn(&str, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let topic = normalize_topic(topic)?;
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&topic) {
            return Err(RemoteClusterError::Conflict { topic });
        }
        debug!(topic = %topic, "Registered inbound handler");
        handlers.insert(topic, Arc::new(handler));
        Ok(())
    }

    /// Remove the handler for `topic`. Returns whether one was installed.
    pub fn unregister_handler(&self, topic: &str) -> bool {
        self.handlers.write().remove(topic.trim()).is_some()
    }

    pub fn has_handler(&self, topic: &str) -> bool {
        self.handlers.read().contains_key(topic.trim())
    }

    /// Hand an inbound payload to its topic's handler.
    ///
    /// The handler's result is returned unchanged. Nothing is retried.
    pub fn dispatch(&self, topic: &str, remote_id: &str, payload: &[u8]) -> Result<()> {
        // Clone out so the handler runs without the lock held
        let handler = self.handlers.read().get(topic.trim()).cloned();

        match handler {
            Some(handler) => handler(remote_id, payload),
            None => {
                warn!(topic = %topic, remote_id = %remote_id, "No handler for inbound topic, dropping");
                self.metrics.unroutable(topic);
                Err(RemoteClusterError::Unroutable {
                    topic: topic.to_string(),
                })
            }
        }
    }
}
