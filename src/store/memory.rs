//! In-process store.

use super::{sort_records, RemoteClusterStore, Store, StoreFuture, UserStore};
use crate::error::RemoteClusterError;
use crate::model::{QueryFilter, RemoteCluster, User};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Store backed by in-memory maps.
///
/// Cloning records on every read keeps callers from holding the lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    remotes: RwLock<HashMap<String, RemoteCluster>>,
    users: RwLock<HashMap<String, User>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub async fn add_user(&self, user: User) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    /// Number of stored records, disabled included.
    pub async fn len(&self) -> usize {
        self.remotes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.remotes.read().await.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn select(&self, filter: &QueryFilter) -> Vec<RemoteCluster> {
        let remotes = self.remotes.read().await;
        let mut out: Vec<RemoteCluster> = remotes
            .values()
            .filter(|rc| filter.matches(rc))
            .cloned()
            .collect();
        sort_records(&mut out);
        out
    }
}

impl RemoteClusterStore for MemoryStore {
    fn get(&self, remote_id: &str) -> StoreFuture<'_, Option<RemoteCluster>> {
        let remote_id = remote_id.to_string();
        Box::pin(async move { Ok(self.remotes.read().await.get(&remote_id).cloned()) })
    }

    fn get_by_topic(&self, topic: &str, filter: &QueryFilter) -> StoreFuture<'_, Vec<RemoteCluster>> {
        let filter = filter.clone().with_topic(topic);
        Box::pin(async move { Ok(self.select(&filter).await) })
    }

    fn get_all(&self, filter: &QueryFilter) -> StoreFuture<'_, Vec<RemoteCluster>> {
        let filter = filter.clone();
        Box::pin(async move { Ok(self.select(&filter).await) })
    }

    fn save(&self, rc: RemoteCluster) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut remotes = self.remotes.write().await;
            if remotes.contains_key(&rc.remote_id) {
                return Err(RemoteClusterError::validation(format!(
                    "remote cluster '{}' already exists",
                    rc.remote_id
                )));
            }
            remotes.insert(rc.remote_id.clone(), rc);
            Ok(())
        })
    }

    fn update(&self, rc: RemoteCluster) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut remotes = self.remotes.write().await;
            match remotes.get_mut(&rc.remote_id) {
                Some(existing) => {
                    *existing = rc;
                    Ok(())
                }
                None => Err(RemoteClusterError::not_found(rc.remote_id)),
            }
        })
    }

    fn update_topics(&self, remote_id: &str, topics: BTreeSet<String>) -> StoreFuture<'_, ()> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let mut remotes = self.remotes.write().await;
            let rc = remotes
                .get_mut(&remote_id)
                .ok_or_else(|| RemoteClusterError::not_found(&remote_id))?;
            rc.topics = topics;
            Ok(())
        })
    }

    fn set_last_ping_at(&self, remote_id: &str, at_ms: i64) -> StoreFuture<'_, ()> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let mut remotes = self.remotes.write().await;
            let rc = remotes
                .get_mut(&remote_id)
                .ok_or_else(|| RemoteClusterError::not_found(&remote_id))?;
            rc.last_ping_at = at_ms;
            Ok(())
        })
    }

    fn delete(&self, remote_id: &str) -> StoreFuture<'_, bool> {
        let remote_id = remote_id.to_string();
        Box::pin(async move { Ok(self.remotes.write().await.remove(&remote_id).is_some()) })
    }
}

impl UserStore for MemoryStore {
    fn get(&self, user_id: &str) -> StoreFuture<'_, User> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.users
                .read()
                .await
                .get(&user_id)
                .cloned()
                .ok_or(RemoteClusterError::UserNotFound { user_id })
        })
    }
}

impl Store for MemoryStore {
    fn remote_cluster(&self) -> &dyn RemoteClusterStore {
        self
    }

    fn user(&self) -> &dyn UserStore {
        self
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        self.closed.store(true, Ordering::Release);
        Box::pin(async { Ok(()) })
    }
}
