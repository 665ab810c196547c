//! Per-remote delivery loop.
//!
//! Each active remote has one loop task that owns its [`RemoteQueue`]. The
//! coordinator feeds it over an unbounded command channel and the loop
//! hands its remaining queue back when it exits, so nothing is shared
//! between the loop and its callers except the pending counter.
//!
//! # Pass
//!
//! 1. Apply queued commands (enqueue / purge).
//! 2. If any topic head is due, re-read the remote record. Missing or
//!    disabled means purge and retire. Topics the remote no longer
//!    subscribes to are purged.
//! 3. Send each due head, one topic at a time.
//! 4. Sleep until the earliest head deadline, a command, the stop signal,
//!    or the idle timeout.
//!
//! # Graceful Shutdown
//!
//! The stop signal is checked at the top of every pass and raced against
//! every send and sleep. An in-flight send gets the shutdown grace to
//! finish; past that the task goes back to the head of its topic with its
//! attempt count unchanged.

use super::queue::RemoteQueue;
use super::types::{DeadLetter, DeadLetterReason, RemoteHealth, SyncTask};
use super::{stopped, CoordinatorInner, LoopCommand};
use crate::error::RemoteClusterError;
use crate::model::{now_millis, RemoteCluster};
use crate::transport::DeliveryError;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// What woke the loop up.
enum Wake {
    Ready,
    Command(LoopCommand),
    Idle,
    Stop,
}

/// Result of one send, before it is applied to the task.
enum SendOutcome {
    Delivered,
    Failed(DeliveryError),
    /// Stop arrived and the send outlived the grace period.
    Abandoned,
}

pub(super) struct DeliveryLoop {
    inner: Arc<CoordinatorInner>,
    remote_id: String,
    generation: u64,
    queue: RemoteQueue,
    cmd_rx: mpsc::UnboundedReceiver<LoopCommand>,
    pending: Arc<AtomicUsize>,
    shutdown_rx: watch::Receiver<bool>,
    /// Every command sender is gone.
    detached: bool,
}

impl DeliveryLoop {
    pub(super) fn new(
        inner: Arc<CoordinatorInner>,
        remote_id: String,
        generation: u64,
        queue: RemoteQueue,
        cmd_rx: mpsc::UnboundedReceiver<LoopCommand>,
        pending: Arc<AtomicUsize>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner,
            remote_id,
            generation,
            queue,
            cmd_rx,
            pending,
            shutdown_rx,
            detached: false,
        }
    }

    /// Run until stopped, retired, or idle. Returns whatever is still queued.
    pub(super) async fn run(self) -> RemoteQueue {
        let span = info_span!("delivery", remote_id = %self.remote_id, generation = self.generation);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> RemoteQueue {
        debug!(queued = self.queue.len(), "Delivery loop started");

        loop {
            if self.stop_requested() {
                self.drain_for_stop();
                debug!(remaining = self.queue.len(), "Delivery loop stopping");
                return self.queue;
            }

            if self.apply_pending_commands() && self.queue.is_empty() && self.leave_table().await {
                debug!("Delivery loop retired after purge");
                return self.queue;
            }

            let mut store_backoff = None;
            if !self.queue.due_topics(Instant::now()).is_empty() {
                match self.inner.registry.get(&self.remote_id).await {
                    Ok(remote) if remote.enabled => {
                        self.purge_unsubscribed(&remote.topics);
                        if !self.deliver_due(&remote).await {
                            continue;
                        }
                    }
                    Ok(_) => {
                        self.purge("remote disabled");
                        if self.leave_table().await {
                            debug!("Delivery loop retired, remote disabled");
                            return self.queue;
                        }
                        continue;
                    }
                    Err(RemoteClusterError::NotFound { .. }) => {
                        self.purge("remote deleted");
                        if self.leave_table().await {
                            debug!("Delivery loop retired, remote deleted");
                            return self.queue;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to re-read remote record, backing off");
                        store_backoff = Some(Instant::now() + self.inner.retry.initial_delay);
                    }
                }
            }

            match self.wait(store_backoff).await {
                Wake::Ready => {}
                Wake::Stop => {}
                Wake::Command(cmd) => {
                    if self.apply(cmd) && self.queue.is_empty() && self.leave_table().await {
                        debug!("Delivery loop retired after purge");
                        return self.queue;
                    }
                }
                Wake::Idle => {
                    if self.leave_table().await {
                        debug!("Delivery loop idle, exiting");
                        return self.queue;
                    }
                }
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.detached || *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    /// Apply one command. Returns true if it was a purge.
    fn apply(&mut self, cmd: LoopCommand) -> bool {
        match cmd {
            LoopCommand::Enqueue(task) => {
                self.queue.push(task);
                false
            }
            LoopCommand::Purge => {
                self.purge("remote disabled");
                true
            }
            LoopCommand::Resubscribe(topics) => {
                self.purge_unsubscribed(&topics);
                true
            }
        }
    }

    /// Apply everything already in the channel. Returns true if any was a purge.
    fn apply_pending_commands(&mut self) -> bool {
        let mut purged = false;
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            purged |= self.apply(cmd);
        }
        purged
    }

    /// Keep enqueued work for the next run; purges still apply.
    fn drain_for_stop(&mut self) {
        self.apply_pending_commands();
    }

    fn purge(&mut self, reason: &str) {
        let purged = self.queue.clear();
        self.record_purge(purged, reason);
    }

    /// Drop queued tasks for topics outside `topics`.
    fn purge_unsubscribed(&mut self, topics: &BTreeSet<String>) {
        let purged = self.queue.retain_topics(|topic| topics.contains(topic));
        self.record_purge(purged, "topic unsubscribed");
    }

    fn record_purge(&self, purged: usize, reason: &str) {
        if purged == 0 {
            return;
        }
        self.pending.fetch_sub(purged, Ordering::AcqRel);
        self.inner.metrics.tasks_purged(&self.remote_id, purged);
        info!(purged, reason, "Purged queued tasks");
    }

    /// Remove this loop from the table once its queue is empty.
    ///
    /// Commands that arrived before the table lock was taken are applied
    /// first. If that left work queued the loop stays registered and the
    /// next pass re-reads the record.
    async fn leave_table(&mut self) -> bool {
        let inner = Arc::clone(&self.inner);
        let mut table = inner.table.lock().await;
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.apply(cmd);
        }
        if !self.queue.is_empty() {
            return false;
        }
        if table.remove_if_current(&self.remote_id, self.generation) {
            inner.metrics.active_loops(table.loops.len());
        }
        true
    }

    async fn wait(&mut self, backoff: Option<Instant>) -> Wake {
        let deadline = backoff.or_else(|| self.queue.next_deadline());
        let idle = self.queue.is_empty();
        let idle_timeout = self.inner.idle_timeout;

        tokio::select! {
            biased;

            _ = stopped(&mut self.shutdown_rx) => Wake::Stop,

            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => Wake::Command(cmd),
                None => {
                    self.detached = true;
                    Wake::Stop
                }
            },

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Ready,

            _ = tokio::time::sleep(idle_timeout), if idle => Wake::Idle,
        }
    }

    /// Send every due head once. Returns false if the pass was cut short by stop.
    async fn deliver_due(&mut self, remote: &RemoteCluster) -> bool {
        for topic in self.queue.due_topics(Instant::now()) {
            if self.stop_requested() {
                return false;
            }
            let Some(task) = self.queue.pop_head(&topic) else {
                continue;
            };
            if !self.attempt(remote, task).await {
                return false;
            }
        }
        true
    }

    /// One delivery attempt. Returns false if the loop must stop.
    async fn attempt(&mut self, remote: &RemoteCluster, mut task: SyncTask) -> bool {
        let inner = Arc::clone(&self.inner);

        // Admission: shared rate limit, then the concurrency cap
        let permit = tokio::select! {
            biased;
            _ = stopped(&mut self.shutdown_rx) => None,
            permit = async {
                if let Some(limiter) = &inner.rate_limiter {
                    limiter.acquire().await;
                }
                inner.bulkhead.acquire().await.ok()
            } => permit,
        };
        let Some(_permit) = permit else {
            self.queue.push_front(task);
            return false;
        };

        inner.metrics.sync_attempt(&self.remote_id, &task.topic);
        let started = Instant::now();

        let outcome = {
            let send = tokio::time::timeout(inner.send_timeout, inner.transport.send(remote, &task));
            tokio::pin!(send);

            let first = tokio::select! {
                biased;
                res = &mut send => Some(res),
                _ = stopped(&mut self.shutdown_rx) => None,
            };
            let res = match first {
                Some(res) => Some(res),
                None => tokio::time::timeout(inner.grace, &mut send).await.ok(),
            };

            match res {
                Some(Ok(Ok(()))) => SendOutcome::Delivered,
                Some(Ok(Err(e))) => SendOutcome::Failed(e),
                Some(Err(_elapsed)) => SendOutcome::Failed(DeliveryError::transient(format!(
                    "send timed out after {:?}",
                    inner.send_timeout
                ))),
                None => SendOutcome::Abandoned,
            }
        };

        match outcome {
            SendOutcome::Delivered => {
                let latency = started.elapsed();
                self.pending.fetch_sub(1, Ordering::AcqRel);
                inner.metrics.sync_success(&self.remote_id, &task.topic);
                inner.metrics.delivery_latency(&self.remote_id, latency);
                self.update_health(|h| {
                    h.delivered += 1;
                    h.consecutive_failures = 0;
                    h.last_success_at = Some(now_millis());
                });
                debug!(
                    task_id = %task.id,
                    topic = %task.topic,
                    attempts = task.attempts,
                    latency_ms = latency.as_millis() as u64,
                    "Delivered task"
                );
                true
            }
            SendOutcome::Failed(err) => {
                self.fail(task, err);
                true
            }
            SendOutcome::Abandoned => {
                warn!(
                    task_id = %task.id,
                    topic = %task.topic,
                    grace_ms = inner.grace.as_millis() as u64,
                    "In-flight send abandoned at shutdown, task requeued"
                );
                inner.metrics.task_abandoned(&self.remote_id);
                task.last_error = Some("abandoned at shutdown".to_string());
                self.queue.push_front(task);
                false
            }
        }
    }

    fn fail(&mut self, mut task: SyncTask, err: DeliveryError) {
        let inner = Arc::clone(&self.inner);
        inner.metrics.sync_failure(&self.remote_id, &task.topic, err.kind());
        self.update_health(|h| {
            h.consecutive_failures += 1;
            h.last_error = Some(err.to_string());
        });

        task.attempts += 1;
        task.last_error = Some(err.message().to_string());

        if !err.is_transient() {
            self.dead_letter(task, DeadLetterReason::Rejected, err.to_string());
            return;
        }

        if inner.retry.is_exhausted(task.attempts) {
            self.dead_letter(task, DeadLetterReason::RetriesExhausted, err.to_string());
            return;
        }

        let delay = inner.retry.delay_for_attempt(task.attempts);
        debug!(
            task_id = %task.id,
            topic = %task.topic,
            attempts = task.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Delivery failed, will retry"
        );
        task.next_attempt_at = Instant::now() + delay;
        self.queue.push_front(task);
    }

    fn dead_letter(&mut self, task: SyncTask, reason: DeadLetterReason, error: String) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.inner.metrics.dead_lettered(&self.remote_id, reason.as_str());
        warn!(
            task_id = %task.id,
            topic = %task.topic,
            attempts = task.attempts,
            reason = reason.as_str(),
            error = %error,
            "Task dead-lettered"
        );

        let evicted = self.inner.dead_letters.push(DeadLetter {
            task,
            reason,
            error,
            dead_lettered_at: now_millis(),
        });
        if let Some(old) = evicted {
            debug!(task_id = %old.task.id, "Dead-letter log full, evicted oldest entry");
        }
    }

    fn update_health(&self, f: impl FnOnce(&mut RemoteHealth)) {
        let mut entry = self
            .inner
            .health
            .entry(self.remote_id.clone())
            .or_insert_with(|| RemoteHealth {
                remote_id: self.remote_id.clone(),
                ..RemoteHealth::default()
            });
        f(entry.value_mut());
    }
}
