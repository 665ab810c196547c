// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-context logger.
//!
//! Each [`ServiceContext`](crate::ServiceContext) owns a [`Logger`] wrapping a
//! `tracing::Dispatch`. Background tasks the context spawns are instrumented
//! with `.with_subscriber(logger.dispatch())`, so two contexts in one process
//! (as in tests) do not share log output and nothing is installed globally.

use crate::config::LoggingConfig;
use crate::error::{RemoteClusterError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Handle to a context's log pipeline.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Logger {
    /// Build a logger writing to stdout.
    pub fn new(config: &LoggingConfig) -> Result<Self> {
        Self::with_writer(config, std::io::stdout)
    }

    /// Build a logger writing to an arbitrary sink.
    pub fn with_writer<W>(config: &LoggingConfig, writer: W) -> Result<Self>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let filter = EnvFilter::try_new(&config.level).map_err(|e| {
            RemoteClusterError::Config(format!("Invalid log level '{}': {}", config.level, e))
        })?;

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true);

        let dispatch = if config.json {
            Dispatch::new(builder.json().finish())
        } else {
            Dispatch::new(builder.with_ansi(false).finish())
        };

        Ok(Self::from_dispatch(dispatch))
    }

    /// Wrap an existing dispatcher (e.g. the process-wide default).
    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A logger that discards everything.
    pub fn disabled() -> Self {
        Self::from_dispatch(Dispatch::none())
    }

    /// The dispatcher background tasks should run under.
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch.clone()
    }

    /// Run a closure with this logger as the current default.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Release the logger.
    ///
    /// Returns `true` only for the call that performed the release.
    pub fn shutdown(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
