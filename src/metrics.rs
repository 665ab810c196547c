//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Delivery attempts, outcomes and latency per remote
//! - Dead letters, purged and abandoned tasks
//! - Unroutable inbound messages
//! - Leadership listener panics
//! - Active delivery loops and remote heartbeats
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `remote_cluster_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Sinks
//!
//! Components never call the `metrics` facade directly. They hold an
//! `Arc<dyn MetricsSink>` handed out by the service context, so tests can
//! swap in a recording sink and embedders can route metrics elsewhere.
//! [`PrometheusMetrics`] forwards to the free functions below.
//!
//! ```rust,no_run
//! use remote_cluster::metrics::{MetricsSink, PrometheusMetrics};
//! use std::time::Duration;
//!
//! let sink = PrometheusMetrics;
//! sink.sync_attempt("remote-1", "share");
//! sink.delivery_latency("remote-1", Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Destination for service metrics.
///
/// Every method has a discarding default, so implementations only override
/// what they care about.
pub trait MetricsSink: Send + Sync {
    /// A send to a remote is about to be attempted.
    fn sync_attempt(&self, _remote_id: &str, _topic: &str) {}

    /// A send completed successfully.
    fn sync_success(&self, _remote_id: &str, _topic: &str) {}

    /// A send failed. `kind` is `transient`, `permanent` or `timeout`.
    fn sync_failure(&self, _remote_id: &str, _topic: &str, _kind: &str) {}

    /// Wall time of a successful send.
    fn delivery_latency(&self, _remote_id: &str, _latency: Duration) {}

    /// A task was moved to the dead-letter log.
    fn dead_lettered(&self, _remote_id: &str, _reason: &str) {}

    /// Queued tasks were dropped because their remote went away.
    fn tasks_purged(&self, _remote_id: &str, _count: usize) {}

    /// An in-flight send was cut off at shutdown.
    fn task_abandoned(&self, _remote_id: &str) {}

    /// An inbound message arrived for a topic with no handler.
    fn unroutable(&self, _topic: &str) {}

    /// A leadership listener panicked.
    fn listener_panic(&self) {}

    /// Number of delivery loops currently running.
    fn active_loops(&self, _count: usize) {}

    /// Result of a heartbeat ping.
    fn heartbeat(&self, _remote_id: &str, _success: bool) {}

    /// Round-trip time of a successful ping.
    fn ping_latency(&self, _remote_id: &str, _latency: Duration) {}
}

/// Sink that forwards to the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn sync_attempt(&self, remote_id: &str, topic: &str) {
        record_sync_attempt(remote_id, topic);
    }

    fn sync_success(&self, remote_id: &str, topic: &str) {
        record_sync_outcome(remote_id, topic, "success");
    }

    fn sync_failure(&self, remote_id: &str, topic: &str, kind: &str) {
        record_sync_outcome(remote_id, topic, kind);
    }

    fn delivery_latency(&self, remote_id: &str, latency: Duration) {
        record_delivery_latency(remote_id, latency);
    }

    fn dead_lettered(&self, remote_id: &str, reason: &str) {
        record_dead_letter(remote_id, reason);
    }

    fn tasks_purged(&self, remote_id: &str, count: usize) {
        record_tasks_purged(remote_id, count);
    }

    fn task_abandoned(&self, remote_id: &str) {
        record_task_abandoned(remote_id);
    }

    fn unroutable(&self, topic: &str) {
        record_unroutable(topic);
    }

    fn listener_panic(&self) {
        record_listener_panic();
    }

    fn active_loops(&self, count: usize) {
        set_active_loops(count);
    }

    fn heartbeat(&self, remote_id: &str, success: bool) {
        record_heartbeat(remote_id, success);
    }

    fn ping_latency(&self, remote_id: &str, latency: Duration) {
        record_ping_latency(remote_id, latency);
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

// =============================================================================
// Delivery Metrics
// =============================================================================

/// Record a delivery attempt.
pub fn record_sync_attempt(remote_id: &str, topic: &str) {
    counter!(
        "remote_cluster_sync_attempts_total",
        "remote_id" => remote_id.to_string(),
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// Record a delivery outcome (`success`, `transient`, `permanent`, `timeout`).
pub fn record_sync_outcome(remote_id: &str, topic: &str, outcome: &str) {
    counter!(
        "remote_cluster_sync_results_total",
        "remote_id" => remote_id.to_string(),
        "topic" => topic.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record send latency.
pub fn record_delivery_latency(remote_id: &str, latency: Duration) {
    histogram!("remote_cluster_delivery_duration_seconds", "remote_id" => remote_id.to_string())
        .record(latency.as_secs_f64());
}

/// Record a dead-lettered task.
pub fn record_dead_letter(remote_id: &str, reason: &str) {
    counter!(
        "remote_cluster_dead_letters_total",
        "remote_id" => remote_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record tasks purged for a disabled or deleted remote.
pub fn record_tasks_purged(remote_id: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!("remote_cluster_tasks_purged_total", "remote_id" => remote_id.to_string())
        .increment(count as u64);
}

/// Record an in-flight send abandoned at shutdown.
pub fn record_task_abandoned(remote_id: &str) {
    counter!("remote_cluster_tasks_abandoned_total", "remote_id" => remote_id.to_string())
        .increment(1);
}

/// Gauge for number of running delivery loops.
pub fn set_active_loops(count: usize) {
    gauge!("remote_cluster_active_loops").set(count as f64);
}

// =============================================================================
// Routing / Leadership Metrics
// =============================================================================

/// Record an inbound message with no handler.
pub fn record_unroutable(topic: &str) {
    counter!("remote_cluster_unroutable_total", "topic" => topic.to_string()).increment(1);
}

/// Record a panicking leadership listener.
pub fn record_listener_panic() {
    counter!("remote_cluster_listener_panics_total").increment(1);
}

/// Record a leadership transition.
pub fn record_leadership_change(is_leader: bool) {
    let to = if is_leader { "leader" } else { "follower" };
    counter!("remote_cluster_leadership_changes_total", "to" => to).increment(1);
    gauge!("remote_cluster_is_leader").set(if is_leader { 1.0 } else { 0.0 });
}

// =============================================================================
// Heartbeat Metrics
// =============================================================================

/// Record a heartbeat ping result.
pub fn record_heartbeat(remote_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "remote_cluster_heartbeats_total",
        "remote_id" => remote_id.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record heartbeat round-trip time.
pub fn record_ping_latency(remote_id: &str, latency: Duration) {
    histogram!("remote_cluster_ping_latency_seconds", "remote_id" => remote_id.to_string())
        .record(latency.as_secs_f64());
}

// =============================================================================
// Store / Lifecycle Metrics
// =============================================================================

/// Record a SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("remote_cluster_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for service state.
pub fn set_service_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("remote_cluster_service_state").set(value);
}
