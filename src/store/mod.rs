// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence traits for registry records and users.
//!
//! The service never talks to a database directly. It is handed an
//! `Arc<dyn Store>` and reaches records through [`Store::remote_cluster()`]
//! and [`Store::user()`]. Two backends ship with the crate:
//!
//! - [`MemoryStore`]: in-process maps, for tests and standalone use
//! - [`SqliteStore`]: durable SQLite (WAL) via `sqlx`
//!
//! # Ordering
//!
//! Every listing returns records ordered by `create_at`, then `remote_id`.
//! Callers rely on this to fan out deterministically.
//!
//! # Example
//!
//! ```rust,no_run
//! use remote_cluster::store::{MemoryStore, Store};
//! use remote_cluster::model::QueryFilter;
//!
//! # async fn example() -> remote_cluster::Result<()> {
//! let store = MemoryStore::new();
//! let enabled = store.remote_cluster().get_all(&QueryFilter::enabled()).await?;
//! assert!(enabled.is_empty());
//! # Ok(())
//! # }
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{QueryFilter, RemoteCluster, User};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage for remote cluster records.
pub trait RemoteClusterStore: Send + Sync + 'static {
    /// Fetch one record, `None` if unknown.
    fn get(&self, remote_id: &str) -> StoreFuture<'_, Option<RemoteCluster>>;

    /// Records subscribed to `topic` that also match `filter`.
    fn get_by_topic(&self, topic: &str, filter: &QueryFilter) -> StoreFuture<'_, Vec<RemoteCluster>>;

    /// Records matching `filter`.
    fn get_all(&self, filter: &QueryFilter) -> StoreFuture<'_, Vec<RemoteCluster>>;

    /// Insert a new record. Fails with `Validation` if the ID exists.
    fn save(&self, rc: RemoteCluster) -> StoreFuture<'_, ()>;

    /// Overwrite an existing record. Fails with `NotFound` if missing.
    fn update(&self, rc: RemoteCluster) -> StoreFuture<'_, ()>;

    /// Replace a record's topic set.
    fn update_topics(&self, remote_id: &str, topics: BTreeSet<String>) -> StoreFuture<'_, ()>;

    /// Record a successful ping.
    fn set_last_ping_at(&self, remote_id: &str, at_ms: i64) -> StoreFuture<'_, ()>;

    /// Hard-delete a record. Returns whether it existed.
    fn delete(&self, remote_id: &str) -> StoreFuture<'_, bool>;
}

/// Lookup of local users for attribution.
pub trait UserStore: Send + Sync + 'static {
    /// Fetch a user. Fails with `UserNotFound` if unknown.
    fn get(&self, user_id: &str) -> StoreFuture<'_, User>;
}

/// Aggregate store handed to the service.
pub trait Store: Send + Sync + 'static {
    fn remote_cluster(&self) -> &dyn RemoteClusterStore;

    fn user(&self) -> &dyn UserStore;

    /// Release backend resources. Default: nothing to release.
    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Sort records into persistence order.
pub(crate) fn sort_records(records: &mut [RemoteCluster]) {
    records.sort_by(|a, b| {
        a.create_at
            .cmp(&b.create_at)
            .then_with(|| a.remote_id.cmp(&b.remote_id))
    });
}
