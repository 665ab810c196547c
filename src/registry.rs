// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry of known remote clusters.
//!
//! Wraps the injected [`Store`] with validation and change notification.
//! Reads go straight to the store. Writes to a single record are serialized
//! with a per-record async mutex, so concurrent `disable` and
//! `update_topics` calls on one remote never interleave their
//! read-modify-write cycles, while writes to different remotes proceed in
//! parallel.
//!
//! Every successful state change is published as a [`RegistryEvent`]. The
//! coordinator subscribes so a disabled or deleted remote has its queued
//! tasks purged without waiting for the loop's next pass.

use crate::error::{RemoteClusterError, Result};
use crate::model::{normalize_topic, normalize_topic_set, now_millis, QueryFilter, RemoteCluster, User};
use crate::store::Store;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// Capacity of the change-event channel. Slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A change to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { remote_id: String },
    Disabled { remote_id: String },
    Enabled { remote_id: String },
    Deleted { remote_id: String },
    TopicsChanged { remote_id: String, topics: BTreeSet<String> },
}

impl RegistryEvent {
    pub fn remote_id(&self) -> &str {
        match self {
            Self::Registered { remote_id }
            | Self::Disabled { remote_id }
            | Self::Enabled { remote_id }
            | Self::Deleted { remote_id }
            | Self::TopicsChanged { remote_id, .. } => remote_id,
        }
    }
}

/// Validated access to remote cluster records.
pub struct RemoteClusterRegistry {
    store: Arc<dyn Store>,
    record_locks: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for RemoteClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClusterRegistry")
            .field("locked_records", &self.record_locks.len())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl RemoteClusterRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            record_locks: DashMap::new(),
            events,
        }
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Enabled remotes subscribed to `topic`, in persistence order.
    pub async fn get_by_topic(&self, topic: &str) -> Result<Vec<RemoteCluster>> {
        let topic = normalize_topic(topic)?;
        self.store
            .remote_cluster()
            .get_by_topic(&topic, &QueryFilter::enabled())
            .await
    }

    /// Records matching `filter`. The default filter includes disabled ones.
    pub async fn get_all(&self, filter: &QueryFilter) -> Result<Vec<RemoteCluster>> {
        self.store.remote_cluster().get_all(filter).await
    }

    pub async fn get(&self, remote_id: &str) -> Result<RemoteCluster> {
        self.store
            .remote_cluster()
            .get(remote_id)
            .await?
            .ok_or_else(|| RemoteClusterError::not_found(remote_id))
    }

    /// Resolve an attribution user.
    pub async fn get_user(&self, user_id: &str) -> Result<User> {
        self.store.user().get(user_id).await
    }

    /// Add a new remote.
    ///
    /// Assigns `create_at` and clears `last_ping_at`.
    pub async fn register(&self, mut rc: RemoteCluster) -> Result<RemoteCluster> {
        rc.validate()?;

        let remote_id = rc.remote_id.clone();
        let lock = self.lock_for(&remote_id);
        let _guard = lock.lock().await;

        let mut exists = false;
        let result = self.register_locked(rc, &mut exists).await;
        if result.is_err() && !exists {
            self.release_lock(&remote_id, &lock);
        }
        result
    }

    async fn register_locked(&self, mut rc: RemoteCluster, exists: &mut bool) -> Result<RemoteCluster> {
        if self.store.remote_cluster().get(&rc.remote_id).await?.is_some() {
            *exists = true;
            return Err(RemoteClusterError::validation(format!(
                "remote cluster '{}' already exists",
                rc.remote_id
            )));
        }

        if let Some(creator_id) = &rc.creator_id {
            match self.store.user().get(creator_id).await {
                Ok(_) => {}
                Err(RemoteClusterError::UserNotFound { user_id }) => {
                    return Err(RemoteClusterError::validation(format!(
                        "creator '{}' does not exist",
                        user_id
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        rc.create_at = now_millis();
        rc.last_ping_at = 0;
        self.store.remote_cluster().save(rc.clone()).await?;

        info!(
            remote_id = %rc.remote_id,
            site_url = %rc.site_url,
            token = %rc.token_fingerprint(),
            topics = ?rc.topics,
            "Registered remote cluster"
        );
        self.publish(RegistryEvent::Registered {
            remote_id: rc.remote_id.clone(),
        });
        Ok(rc)
    }

    /// Record a successful ping at the current time.
    pub async fn update_heartbeat(&self, remote_id: &str) -> Result<()> {
        self.locked(remote_id, async {
            self.store
                .remote_cluster()
                .set_last_ping_at(remote_id, now_millis())
                .await
        })
        .await
    }

    /// Replace a remote's topic subscriptions.
    pub async fn update_topics<I, S>(&self, remote_id: &str, topics: I) -> Result<RemoteCluster>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics = normalize_topic_set(topics)?;
        self.locked(remote_id, self.replace_topics(remote_id, topics)).await
    }

    async fn replace_topics(&self, remote_id: &str, topics: BTreeSet<String>) -> Result<RemoteCluster> {
        let mut rc = self.get(remote_id).await?;
        if rc.topics == topics {
            return Ok(rc);
        }

        self.store
            .remote_cluster()
            .update_topics(remote_id, topics.clone())
            .await?;
        rc.topics = topics.clone();

        info!(remote_id = %remote_id, topics = ?topics, "Updated remote topics");
        self.publish(RegistryEvent::TopicsChanged {
            remote_id: remote_id.to_string(),
            topics,
        });
        Ok(rc)
    }

    /// Soft-delete a remote. Disabling a disabled remote is a no-op.
    pub async fn disable(&self, remote_id: &str) -> Result<()> {
        self.set_enabled(remote_id, false).await
    }

    /// Re-enable a soft-deleted remote. Idempotent.
    pub async fn enable(&self, remote_id: &str) -> Result<()> {
        self.set_enabled(remote_id, true).await
    }

    /// Hard-delete a remote. Returns whether it existed.
    pub async fn delete(&self, remote_id: &str) -> Result<bool> {
        let existed = {
            let lock = self.lock_for(remote_id);
            let _guard = lock.lock().await;
            let existed = self.store.remote_cluster().delete(remote_id).await;
            self.release_lock(remote_id, &lock);
            existed?
        };

        if existed {
            info!(remote_id = %remote_id, "Deleted remote cluster");
            self.publish(RegistryEvent::Deleted {
                remote_id: remote_id.to_string(),
            });
        }
        Ok(existed)
    }

    async fn set_enabled(&self, remote_id: &str, enabled: bool) -> Result<()> {
        self.locked(remote_id, self.toggle(remote_id, enabled)).await
    }

    async fn toggle(&self, remote_id: &str, enabled: bool) -> Result<()> {
        let mut rc = self.get(remote_id).await?;
        if rc.enabled == enabled {
            debug!(remote_id = %remote_id, enabled, "Remote already in requested state");
            return Ok(());
        }

        rc.enabled = enabled;
        self.store.remote_cluster().update(rc).await?;

        let remote_id = remote_id.to_string();
        if enabled {
            info!(remote_id = %remote_id, "Enabled remote cluster");
            self.publish(RegistryEvent::Enabled { remote_id });
        } else {
            info!(remote_id = %remote_id, "Disabled remote cluster");
            self.publish(RegistryEvent::Disabled { remote_id });
        }
        Ok(())
    }

    /// Run `op` holding the record lock. An unknown record leaves no lock behind.
    async fn locked<T>(&self, remote_id: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        let lock = self.lock_for(remote_id);
        let _guard = lock.lock().await;

        let result = op.await;
        if matches!(result, Err(RemoteClusterError::NotFound { .. })) {
            self.release_lock(remote_id, &lock);
        }
        result
    }

    fn lock_for(&self, remote_id: &str) -> Arc<Mutex<()>> {
        self.record_locks
            .entry(remote_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop `lock`'s entry unless another caller holds a clone of it.
    ///
    /// Must be called with `lock` held. Clones are only taken under the
    /// map's shard lock, so a waiter always shares the caller's mutex.
    fn release_lock(&self, remote_id: &str, lock: &Arc<Mutex<()>>) {
        self.record_locks
            .remove_if(remote_id, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2);
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
