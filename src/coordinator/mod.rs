// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound sync coordinator.
//!
//! Ties together:
//! - The remote registry, for the set of active remotes
//! - The leader tracker, since only the leader delivers
//! - One delivery loop per active remote via [`delivery`]
//! - The heartbeat task via [`heartbeat`]
//!
//! # Architecture
//!
//! ```text
//!  submit() ──► loop table ──mpsc──► delivery loop (remote A) ──► transport
//!                   │        ──mpsc──► delivery loop (remote B) ──► transport
//!                   │
//!                   └─ parked queues (not leader / stopped)
//!
//!  registry events ──► watcher ──► Purge / spawn
//! ```
//!
//! The loop table lives behind one async mutex. Every decision that adds
//! or removes a loop (submission, idle exit, retirement after purge, stop)
//! is made under it, so a submission is either seen by a live loop or
//! starts a new one.

mod delivery;
mod heartbeat;
mod queue;
mod types;

pub use queue::{DeadLetterLog, RemoteQueue};
pub use types::{CoordinatorHealth, DeadLetter, DeadLetterReason, RemoteHealth, SyncTask, TaskId};

use crate::config::{HeartbeatConfig, ServiceConfig};
use crate::error::{RemoteClusterError, Result};
use crate::leader::LeaderAffinityTracker;
use crate::metrics::MetricsSink;
use crate::model::{normalize_topic, QueryFilter};
use crate::registry::{RegistryEvent, RemoteClusterRegistry};
use crate::resilience::{Bulkhead, RateLimiter, RetryConfig};
use crate::router::TopicRouter;
use crate::transport::SyncTransport;
use dashmap::DashMap;
use delivery::DeliveryLoop;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn, Dispatch};

/// Sent from the coordinator to a delivery loop.
pub(crate) enum LoopCommand {
    Enqueue(SyncTask),
    /// The remote was disabled or deleted.
    Purge,
    /// The remote now subscribes to exactly these topics.
    Resubscribe(BTreeSet<String>),
}

struct LoopHandle {
    generation: u64,
    cmd_tx: mpsc::UnboundedSender<LoopCommand>,
    /// Tasks owned by the loop: queued, in the channel, or in flight.
    pending: Arc<AtomicUsize>,
    handle: JoinHandle<RemoteQueue>,
}

/// Resources of one leadership term.
struct RunState {
    shutdown_tx: watch::Sender<bool>,
    aux_handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct LoopTable {
    running: bool,
    run: Option<RunState>,
    loops: HashMap<String, LoopHandle>,
    /// Work held while not delivering, resumed on the next start.
    parked: HashMap<String, RemoteQueue>,
    /// Pending counters of loops that `stop` is still waiting on.
    stopping: HashMap<String, Arc<AtomicUsize>>,
    next_generation: u64,
}

impl LoopTable {
    /// Remove a loop's entry unless it has already been replaced.
    fn remove_if_current(&mut self, remote_id: &str, generation: u64) -> bool {
        if self.loops.get(remote_id).is_some_and(|l| l.generation == generation) {
            self.loops.remove(remote_id);
            true
        } else {
            false
        }
    }

    fn stopping_count(&self, remote_id: &str) -> usize {
        self.stopping.get(remote_id).map_or(0, |p| p.load(Ordering::Acquire))
    }

    fn park(&mut self, remote_id: String, queue: RemoteQueue) {
        if queue.is_empty() {
            return;
        }
        self.parked.entry(remote_id).or_default().append(queue);
    }
}

pub(crate) struct CoordinatorInner {
    registry: Arc<RemoteClusterRegistry>,
    router: Arc<TopicRouter>,
    tracker: Arc<LeaderAffinityTracker>,
    transport: Arc<dyn SyncTransport>,
    metrics: Arc<dyn MetricsSink>,
    retry: RetryConfig,
    send_timeout: Duration,
    idle_timeout: Duration,
    grace: Duration,
    shutdown_timeout: Duration,
    heartbeat: HeartbeatConfig,
    rate_limiter: Option<RateLimiter>,
    bulkhead: Bulkhead,
    dead_letters: DeadLetterLog,
    health: DashMap<String, RemoteHealth>,
    next_task_id: AtomicU64,
    dispatch: Dispatch,
    running: AtomicBool,
    table: Mutex<LoopTable>,
    /// Serializes `start` and `stop`.
    lifecycle: Mutex<()>,
}

impl CoordinatorInner {
    /// Hand a task to its remote's loop, starting one if needed.
    ///
    /// Must be called with the table lock held.
    fn route(self: &Arc<Self>, table: &mut LoopTable, task: SyncTask) {
        if !table.running {
            debug!(remote_id = %task.remote_id, task_id = %task.id, "Coordinator not running, parking task");
            table.parked.entry(task.remote_id.clone()).or_default().push(task);
            return;
        }

        let task = match table.loops.get(&task.remote_id) {
            Some(entry) => {
                entry.pending.fetch_add(1, Ordering::AcqRel);
                match entry.cmd_tx.send(LoopCommand::Enqueue(task)) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(cmd)) => {
                        entry.pending.fetch_sub(1, Ordering::AcqRel);
                        let LoopCommand::Enqueue(task) = cmd else {
                            return;
                        };
                        warn!(remote_id = %task.remote_id, "Delivery loop gone, respawning");
                        table.loops.remove(&task.remote_id);
                        task
                    }
                }
            }
            None => task,
        };

        let remote_id = task.remote_id.clone();
        let mut queue = RemoteQueue::new();
        queue.push(task);
        self.spawn_loop(table, remote_id, queue);
    }

    /// Start a loop for `remote_id` seeded with `queue`.
    fn spawn_loop(self: &Arc<Self>, table: &mut LoopTable, remote_id: String, queue: RemoteQueue) {
        let Some(run) = table.run.as_ref() else {
            table.park(remote_id, queue);
            return;
        };
        let shutdown_rx = run.shutdown_tx.subscribe();

        table.next_generation += 1;
        let generation = table.next_generation;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(queue.len()));

        let delivery = DeliveryLoop::new(
            Arc::clone(self),
            remote_id.clone(),
            generation,
            queue,
            cmd_rx,
            Arc::clone(&pending),
            shutdown_rx,
        );
        let handle = tokio::spawn(delivery.run().with_subscriber(self.dispatch.clone()));

        debug!(remote_id = %remote_id, generation, "Spawned delivery loop");
        table.loops.insert(
            remote_id,
            LoopHandle {
                generation,
                cmd_tx,
                pending,
                handle,
            },
        );
        self.metrics.active_loops(table.loops.len());
    }

    async fn on_registry_event(self: &Arc<Self>, event: RegistryEvent) {
        match event {
            RegistryEvent::Disabled { remote_id } | RegistryEvent::Deleted { remote_id } => {
                let table = self.table.lock().await;
                if let Some(entry) = table.loops.get(&remote_id) {
                    debug!(remote_id = %remote_id, "Remote deactivated, purging its loop");
                    // A closed channel means the loop already left
                    let _ = entry.cmd_tx.send(LoopCommand::Purge);
                }
            }
            RegistryEvent::Registered { remote_id } | RegistryEvent::Enabled { remote_id } => {
                let mut table = self.table.lock().await;
                if table.running && !table.loops.contains_key(&remote_id) {
                    let queue = table.parked.remove(&remote_id).unwrap_or_default();
                    self.spawn_loop(&mut table, remote_id, queue);
                }
            }
            RegistryEvent::TopicsChanged { remote_id, topics } => {
                debug!(remote_id = %remote_id, topics = ?topics, "Remote topics changed");
                // The event may trail a newer update, so send the stored set
                let topics = match self.registry.get(&remote_id).await {
                    Ok(remote) => remote.topics,
                    Err(e) => {
                        debug!(remote_id = %remote_id, error = %e, "Topics changed for unreadable remote");
                        return;
                    }
                };
                let table = self.table.lock().await;
                if let Some(entry) = table.loops.get(&remote_id) {
                    let _ = entry.cmd_tx.send(LoopCommand::Resubscribe(topics));
                }
            }
        }
    }
}

/// Resolves once the stop signal is set or its sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_registry_watcher(
    inner: Arc<CoordinatorInner>,
    mut events: broadcast::Receiver<RegistryEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown_rx) => break,
            event = events.recv() => match event {
                Ok(event) => inner.on_registry_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Loops re-read their record before sending, so missed
                    // disables are still caught on the next pass
                    warn!(skipped, "Registry watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Registry watcher stopped");
}

/// Drives outbound delivery while this node is the leader.
///
/// Cheap to clone; clones share one coordinator.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("running", &self.is_running())
            .field("dead_letters", &self.inner.dead_letters.len())
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(
        config: &ServiceConfig,
        registry: Arc<RemoteClusterRegistry>,
        router: Arc<TopicRouter>,
        tracker: Arc<LeaderAffinityTracker>,
        transport: Arc<dyn SyncTransport>,
        metrics: Arc<dyn MetricsSink>,
        dispatch: Dispatch,
    ) -> Self {
        let delivery = &config.delivery;
        let rate_limiter = delivery.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for delivery"
            );
            RateLimiter::new(cfg)
        });

        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                router,
                tracker,
                transport,
                metrics,
                retry: delivery.retry_config(),
                send_timeout: delivery.send_timeout_duration(),
                idle_timeout: delivery.idle_loop_timeout_duration(),
                grace: config.shutdown.grace_duration(),
                shutdown_timeout: config.shutdown.timeout_duration(),
                heartbeat: config.heartbeat.clone(),
                rate_limiter,
                bulkhead: Bulkhead::new(delivery.max_concurrent_sends),
                dead_letters: DeadLetterLog::new(delivery.dead_letter_capacity),
                health: DashMap::new(),
                next_task_id: AtomicU64::new(1),
                dispatch,
                running: AtomicBool::new(false),
                table: Mutex::new(LoopTable::default()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Begin delivering. Does nothing unless this node is the leader.
    ///
    /// 1. Enumerates enabled remotes
    /// 2. Spawns one delivery loop per remote, seeded with parked work
    /// 3. Spawns the registry watcher
    /// 4. Spawns the heartbeat task (if enabled)
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if !inner.tracker.is_leader() {
            debug!("Not the leader, coordinator stays idle");
            return Ok(());
        }
        if inner.table.lock().await.running {
            debug!("Coordinator already running");
            return Ok(());
        }

        // Subscribe before listing so no registration slips between the two
        let events = inner.registry.subscribe();
        let remotes = inner.registry.get_all(&QueryFilter::enabled()).await?;

        let mut table = inner.table.lock().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        table.run = Some(RunState {
            shutdown_tx,
            aux_handles: Vec::new(),
        });
        table.running = true;
        inner.running.store(true, Ordering::Release);

        for remote in &remotes {
            let queue = table.parked.remove(&remote.remote_id).unwrap_or_default();
            inner.spawn_loop(&mut table, remote.remote_id.clone(), queue);
        }

        // Parked work for remotes that are no longer enabled; each loop
        // re-reads its record and purges
        let leftovers: Vec<(String, RemoteQueue)> = table.parked.drain().collect();
        for (remote_id, queue) in leftovers {
            inner.spawn_loop(&mut table, remote_id, queue);
        }

        let mut aux_handles = vec![tokio::spawn(
            run_registry_watcher(Arc::clone(inner), events, shutdown_rx.clone())
                .with_subscriber(inner.dispatch.clone()),
        )];
        if inner.heartbeat.enabled {
            aux_handles.push(tokio::spawn(
                heartbeat::run_heartbeat(Arc::clone(inner), shutdown_rx).with_subscriber(inner.dispatch.clone()),
            ));
        }
        if let Some(run) = table.run.as_mut() {
            run.aux_handles = aux_handles;
        }

        info!(
            remotes = remotes.len(),
            loops = table.loops.len(),
            heartbeat = inner.heartbeat.enabled,
            "Sync coordinator started"
        );
        Ok(())
    }

    /// Stop delivering and park whatever is still queued.
    ///
    /// Waits for every task to exit, bounded by the shutdown timeout. A loop
    /// that does not exit in time is aborted and its queue is lost.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let (loops, run) = {
            let mut table = inner.table.lock().await;
            if !table.running {
                // Only left over if an earlier stop was cancelled midway
                table.stopping.clear();
                inner.running.store(false, Ordering::Release);
                debug!("Coordinator not running, nothing to stop");
                return;
            }
            table.running = false;
            let run = table.run.take();
            if let Some(run) = &run {
                let _ = run.shutdown_tx.send(true);
            }
            let loops: Vec<(String, LoopHandle)> = table.loops.drain().collect();
            // Still owned until parked below
            for (remote_id, entry) in &loops {
                table.stopping.insert(remote_id.clone(), Arc::clone(&entry.pending));
            }
            (loops, run)
        };

        info!(loops = loops.len(), "Stopping sync coordinator");
        let deadline = Instant::now() + inner.shutdown_timeout;

        let mut returned = Vec::with_capacity(loops.len());
        for (remote_id, mut entry) in loops {
            match tokio::time::timeout_at(deadline, &mut entry.handle).await {
                Ok(Ok(queue)) => {
                    debug!(remote_id = %remote_id, remaining = queue.len(), "Delivery loop stopped");
                    returned.push((remote_id, queue));
                }
                Ok(Err(e)) => {
                    warn!(remote_id = %remote_id, error = %e, "Delivery loop panicked, queued tasks abandoned");
                    inner.metrics.task_abandoned(&remote_id);
                }
                Err(_) => {
                    entry.handle.abort();
                    warn!(
                        remote_id = %remote_id,
                        pending = entry.pending.load(Ordering::Acquire),
                        "Delivery loop did not stop in time, queued tasks abandoned"
                    );
                    inner.metrics.task_abandoned(&remote_id);
                }
            }
        }

        if let Some(run) = run {
            for mut handle in run.aux_handles {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Coordinator task panicked during shutdown"),
                    Err(_) => {
                        handle.abort();
                        warn!("Coordinator task timed out during shutdown");
                    }
                }
            }
        }

        let mut table = inner.table.lock().await;
        table.stopping.clear();
        for (remote_id, mut queue) in returned {
            // Submitted while stopping, so it goes behind
            if let Some(later) = table.parked.remove(&remote_id) {
                queue.append(later);
            }
            table.park(remote_id, queue);
        }
        let parked: usize = table.parked.values().map(RemoteQueue::len).sum();
        inner.running.store(false, Ordering::Release);
        inner.metrics.active_loops(0);
        info!(parked, "Sync coordinator stopped");
    }

    /// Queue `payload` for `remote_id` on `topic`.
    ///
    /// Fails with `NotFound` for an unknown remote and `Validation` for a
    /// disabled remote or a topic it is not subscribed to.
    pub async fn submit(&self, remote_id: &str, topic: &str, payload: impl Into<Arc<[u8]>>) -> Result<TaskId> {
        self.enqueue(remote_id, topic, payload.into(), None).await
    }

    /// Like [`submit`](Self::submit), attributed to `user_id`.
    pub async fn submit_as(
        &self,
        user_id: &str,
        remote_id: &str,
        topic: &str,
        payload: impl Into<Arc<[u8]>>,
    ) -> Result<TaskId> {
        self.inner.registry.get_user(user_id).await?;
        self.enqueue(remote_id, topic, payload.into(), Some(user_id.to_string()))
            .await
    }

    /// Queue `payload` for every enabled remote subscribed to `topic`.
    pub async fn broadcast(&self, topic: &str, payload: impl Into<Arc<[u8]>>) -> Result<Vec<TaskId>> {
        let payload = payload.into();
        let remotes = self.inner.router.remotes_for_topic(topic).await?;

        let mut ids = Vec::with_capacity(remotes.len());
        for remote in remotes {
            match self.enqueue(&remote.remote_id, topic, Arc::clone(&payload), None).await {
                Ok(id) => ids.push(id),
                // Changed since the lookup
                Err(e @ (RemoteClusterError::NotFound { .. } | RemoteClusterError::Validation(_))) => {
                    debug!(remote_id = %remote.remote_id, error = %e, "Skipping remote in broadcast");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ids)
    }

    async fn enqueue(
        &self,
        remote_id: &str,
        topic: &str,
        payload: Arc<[u8]>,
        user_id: Option<String>,
    ) -> Result<TaskId> {
        let inner = &self.inner;
        let topic = normalize_topic(topic)?;
        let remote = inner.registry.get(remote_id).await?;

        if !remote.enabled {
            return Err(RemoteClusterError::validation(format!(
                "remote cluster '{}' is disabled",
                remote_id
            )));
        }
        if !remote.subscribes_to(&topic) {
            return Err(RemoteClusterError::validation(format!(
                "remote cluster '{}' is not subscribed to topic '{}'",
                remote_id, topic
            )));
        }

        let id = TaskId::new(inner.next_task_id.fetch_add(1, Ordering::Relaxed));
        let task = SyncTask::new(id, remote.remote_id, topic, payload, user_id);

        let mut table = inner.table.lock().await;
        inner.route(&mut table, task);
        Ok(id)
    }

    /// True from `start` until `stop` has parked every returned queue.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub async fn active_loops(&self) -> usize {
        self.inner.table.lock().await.loops.len()
    }

    /// Tasks for `remote_id` not yet delivered, dead-lettered, or purged.
    pub async fn pending_count(&self, remote_id: &str) -> usize {
        let table = self.inner.table.lock().await;
        let live = table
            .loops
            .get(remote_id)
            .map_or(0, |l| l.pending.load(Ordering::Acquire));
        let parked = table.parked.get(remote_id).map_or(0, RemoteQueue::len);
        live + table.stopping_count(remote_id) + parked
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.all()
    }

    pub fn dead_letters_for(&self, remote_id: &str) -> Vec<DeadLetter> {
        self.inner.dead_letters.for_remote(remote_id)
    }

    /// Snapshot for monitoring endpoints. No store or network I/O.
    pub async fn health(&self) -> CoordinatorHealth {
        let table = self.inner.table.lock().await;
        let pending_tasks = table
            .loops
            .values()
            .map(|l| &l.pending)
            .chain(table.stopping.values())
            .map(|p| p.load(Ordering::Acquire))
            .sum();
        let parked_tasks = table.parked.values().map(RemoteQueue::len).sum();

        let mut remotes: Vec<RemoteHealth> = self.inner.health.iter().map(|e| e.value().clone()).collect();
        remotes.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));

        CoordinatorHealth {
            running: table.running,
            is_leader: self.inner.tracker.is_leader(),
            active_loops: table.loops.len(),
            pending_tasks,
            parked_tasks,
            dead_letters: self.inner.dead_letters.len(),
            remotes,
        }
    }
}
