// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound transport boundary.
//!
//! The wire protocol belongs to the embedding application. The coordinator
//! only needs to hand a task to a remote and to ping it, and to know whether
//! a failure is worth retrying.
//!
//! # Example
//!
//! ```rust,no_run
//! use remote_cluster::transport::{SyncTransport, DeliveryError, TransportFuture};
//! use remote_cluster::{RemoteCluster, SyncTask};
//! use std::time::Duration;
//!
//! struct HttpTransport { /* client, ... */ }
//!
//! impl SyncTransport for HttpTransport {
//!     fn send<'a>(&'a self, remote: &'a RemoteCluster, task: &'a SyncTask) -> TransportFuture<'a, ()> {
//!         Box::pin(async move {
//!             // POST task.payload to remote.site_url ...
//!             Ok(())
//!         })
//!     }
//!
//!     fn ping<'a>(&'a self, _remote: &'a RemoteCluster) -> TransportFuture<'a, Duration> {
//!         Box::pin(async move { Err(DeliveryError::transient("not implemented")) })
//!     }
//! }
//! ```

use crate::coordinator::SyncTask;
use crate::error::RemoteClusterError;
use crate::model::RemoteCluster;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeliveryError>> + Send + 'a>>;

/// Why a send or ping failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Network or remote-side failure. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// The remote rejected the payload. Dead-lettered immediately.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }

    /// Attach the remote this failure came from.
    pub fn into_error(self, remote_id: &str) -> RemoteClusterError {
        let remote_id = remote_id.to_string();
        match self {
            Self::Transient(message) => RemoteClusterError::TransientDelivery { remote_id, message },
            Self::Permanent(message) => RemoteClusterError::PermanentDelivery { remote_id, message },
        }
    }
}

/// What the coordinator needs from the wire layer.
pub trait SyncTransport: Send + Sync + 'static {
    /// Deliver one task to `remote`.
    fn send<'a>(&'a self, remote: &'a RemoteCluster, task: &'a SyncTask) -> TransportFuture<'a, ()>;

    /// Check that `remote` is reachable. Returns the round-trip time.
    fn ping<'a>(&'a self, remote: &'a RemoteCluster) -> TransportFuture<'a, Duration>;
}

/// A transport that accepts everything.
///
/// Logs operations but doesn't send anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTransport;

impl SyncTransport for NoOpTransport {
    fn send<'a>(&'a self, remote: &'a RemoteCluster, task: &'a SyncTask) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(
                remote_id = %remote.remote_id,
                topic = %task.topic,
                task_id = %task.id,
                len = task.payload.len(),
                "NoOp: would send task"
            );
            Ok(())
        })
    }

    fn ping<'a>(&'a self, remote: &'a RemoteCluster) -> TransportFuture<'a, Duration> {
        Box::pin(async move {
            tracing::trace!(remote_id = %remote.remote_id, "NoOp: ping");
            Ok(Duration::ZERO)
        })
    }
}
