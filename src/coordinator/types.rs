//! Coordinator data types.
//!
//! # Task Lifecycle
//!
//! ```text
//!  submit() ──► queued ──send ok──► delivered (dropped)
//!                 │  ▲
//!       transient │  │ backoff elapsed
//!                 ▼  │
//!              retrying ──attempts == max──► dead letter (RetriesExhausted)
//!                 │
//!       permanent └──────────────────────► dead letter (Rejected)
//!
//!  remote disabled/deleted: queued/retrying ──► purged (counted, not kept)
//! ```

use crate::model::now_millis;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// Identifier of a submitted task, monotonic per coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// One payload bound for one remote.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub id: TaskId,
    pub remote_id: String,
    pub topic: String,
    pub payload: Arc<[u8]>,
    /// User the payload is sent on behalf of.
    pub user_id: Option<String>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Not eligible for sending before this instant.
    pub next_attempt_at: Instant,
    /// Epoch millis at submission.
    pub created_at: i64,
    pub last_error: Option<String>,
}

impl SyncTask {
    pub fn new(
        id: TaskId,
        remote_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Arc<[u8]>>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            id,
            remote_id: remote_id.into(),
            topic: topic.into(),
            payload: payload.into(),
            user_id,
            attempts: 0,
            next_attempt_at: Instant::now(),
            created_at: now_millis(),
            last_error: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt_at <= now
    }
}

/// Why a task was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeadLetterReason {
    /// Transient failures reached the attempt cap.
    RetriesExhausted,
    /// The remote rejected the payload.
    Rejected,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Rejected => "rejected",
        }
    }
}

/// A task that will not be delivered.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub task: SyncTask,
    pub reason: DeadLetterReason,
    pub error: String,
    /// Epoch millis.
    pub dead_lettered_at: i64,
}

/// Delivery health for one remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteHealth {
    pub remote_id: String,
    pub delivered: u64,
    pub consecutive_failures: u32,
    /// Epoch millis of the last successful send, if any.
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Snapshot for monitoring endpoints.
///
/// Collected from in-memory state only; no store or network I/O.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorHealth {
    pub running: bool,
    pub is_leader: bool,
    pub active_loops: usize,
    /// Tasks held by running loops, or by loops still stopping.
    pub pending_tasks: usize,
    /// Tasks waiting for leadership.
    pub parked_tasks: usize,
    pub dead_letters: usize,
    pub remotes: Vec<RemoteHealth>,
}

impl CoordinatorHealth {
    /// Ready to deliver: running as leader.
    pub fn ready(&self) -> bool {
        self.running && self.is_leader
    }
}
