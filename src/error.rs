// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the remote cluster service.
//!
//! Errors are split by where they surface. Registry and router errors are
//! returned synchronously to the caller. Delivery errors never leave the
//! delivery loops: they are retried or dead-lettered and only show up in
//! logs and metrics.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Validation` | No | Malformed or duplicate registration/submission |
//! | `NotFound` | No | Operation on an unknown remote ID |
//! | `UserNotFound` | No | Attribution user does not exist |
//! | `Conflict` | No | Second handler registered for a topic |
//! | `Unroutable` | No | Inbound message for a topic with no handler |
//! | `TransientDelivery` | Yes | Network or remote-side failure during send |
//! | `PermanentDelivery` | No | Remote explicitly rejected the payload |
//! | `Store` | No | SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Service is shutting down |
//! | `Internal` | No | Unexpected internal error |

use thiserror::Error;

/// Result type alias for remote cluster operations.
pub type Result<T> = std::result::Result<T, RemoteClusterError>;

/// Errors that can occur in the remote cluster service.
#[derive(Error, Debug)]
pub enum RemoteClusterError {
    /// Malformed or duplicate input.
    ///
    /// Rejected outright, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No remote with this ID is registered.
    #[error("Remote cluster not found: {remote_id}")]
    NotFound { remote_id: String },

    /// The user a registration is attributed to does not exist.
    #[error("User not found: {user_id}")]
    UserNotFound { user_id: String },

    /// A handler is already registered for this topic.
    ///
    /// Fatal at setup time: the first registration stays active.
    #[error("Handler already registered for topic '{topic}'")]
    Conflict { topic: String },

    /// No handler is registered for this topic.
    ///
    /// The inbound message is dropped after logging and counting.
    #[error("No handler registered for topic '{topic}'")]
    Unroutable { topic: String },

    /// Network or remote-side failure while sending.
    ///
    /// Retried with exponential backoff up to the attempt cap.
    #[error("Transient delivery error ({remote_id}): {message}")]
    TransientDelivery { remote_id: String, message: String },

    /// The remote rejected the payload (e.g. auth failure).
    ///
    /// Moved straight to the dead-letter log.
    #[error("Permanent delivery error ({remote_id}): {message}")]
    PermanentDelivery { remote_id: String, message: String },

    /// SQLite error in the persistent store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RemoteClusterError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error for a remote ID.
    pub fn not_found(remote_id: impl Into<String>) -> Self {
        Self::NotFound {
            remote_id: remote_id.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientDelivery { .. } => true,
            Self::Validation(_) => false,
            Self::NotFound { .. } => false,
            Self::UserNotFound { .. } => false,
            Self::Conflict { .. } => false,
            Self::Unroutable { .. } => false,
            Self::PermanentDelivery { .. } => false,
            Self::Store(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::UserNotFound { .. } => "user_not_found",
            Self::Conflict { .. } => "conflict",
            Self::Unroutable { .. } => "unroutable",
            Self::TransientDelivery { .. } => "transient",
            Self::PermanentDelivery { .. } => "permanent",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
