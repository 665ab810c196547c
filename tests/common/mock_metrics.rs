//! MetricsSink that counts what it is told.

use remote_cluster::metrics::MetricsSink;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub attempts: AtomicUsize,
    pub successes: AtomicUsize,
    pub failures: AtomicUsize,
    pub dead_lettered: AtomicUsize,
    pub purged: AtomicUsize,
    pub abandoned: AtomicUsize,
    pub unroutable: AtomicUsize,
    pub listener_panics: AtomicUsize,
    pub heartbeats_ok: AtomicUsize,
    pub heartbeats_failed: AtomicUsize,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl MetricsSink for RecordingMetrics {
    fn sync_attempt(&self, _remote_id: &str, _topic: &str) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_success(&self, _remote_id: &str, _topic: &str) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_failure(&self, _remote_id: &str, _topic: &str, _kind: &str) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn delivery_latency(&self, _remote_id: &str, _latency: Duration) {}

    fn dead_lettered(&self, _remote_id: &str, _reason: &str) {
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
    }

    fn tasks_purged(&self, _remote_id: &str, count: usize) {
        self.purged.fetch_add(count, Ordering::SeqCst);
    }

    fn task_abandoned(&self, _remote_id: &str) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    fn unroutable(&self, _topic: &str) {
        self.unroutable.fetch_add(1, Ordering::SeqCst);
    }

    fn listener_panic(&self) {
        self.listener_panics.fetch_add(1, Ordering::SeqCst);
    }

    fn heartbeat(&self, _remote_id: &str, success: bool) {
        if success {
            self.heartbeats_ok.fetch_add(1, Ordering::SeqCst);
        } else {
            self.heartbeats_failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
