//! Service lifecycle state.
//!
//! # State Transitions
//!
//! ```text
//!           new()              shutdown()
//! Created ─────────► Running ─────────────► ShuttingDown ─────► Stopped
//! ```
//!
//! Leadership changes happen inside `Running`; they start and stop the
//! coordinator but do not change the service state.

/// State of a [`ServiceContext`](super::ServiceContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Collaborators built, leadership driver not yet running.
    Created,

    /// Following leadership.
    ///
    /// The coordinator delivers while this node leads.
    Running,

    /// `shutdown()` called. Loops are draining.
    ShuttingDown,

    /// Shut down. Safe to drop.
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
