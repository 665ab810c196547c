// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service context.
//!
//! Bundles the collaborators one remote-cluster service needs and owns
//! their lifecycle:
//! - Configuration and the metrics sink
//! - The per-context [`Logger`]
//! - The injected [`Store`], with the registry and router on top of it
//! - The leader tracker and the sync coordinator
//!
//! # Leadership
//!
//! The context registers an internal listener on the tracker. The listener
//! only publishes the new state on a watch channel; a driver task applies
//! it by starting or stopping the coordinator. Rapid flapping therefore
//! collapses to the latest state, and start/stop never run inside a
//! listener.

mod types;

pub use types::ServiceState;

use crate::config::ServiceConfig;
use crate::coordinator::{stopped, SyncCoordinator};
use crate::error::{RemoteClusterError, Result};
use crate::leader::{ClusterMembership, LeaderAffinityTracker, SubscriptionId};
use crate::logging::Logger;
use crate::metrics::{self, MetricsSink};
use crate::registry::RemoteClusterRegistry;
use crate::router::TopicRouter;
use crate::store::Store;
use crate::transport::SyncTransport;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

struct Driver {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Everything one remote-cluster service runs on.
pub struct ServiceContext {
    config: Arc<ServiceConfig>,
    metrics: Arc<dyn MetricsSink>,
    logger: Logger,
    store: Arc<dyn Store>,
    registry: Arc<RemoteClusterRegistry>,
    router: Arc<TopicRouter>,
    leader: Arc<LeaderAffinityTracker>,
    coordinator: SyncCoordinator,
    state_tx: watch::Sender<ServiceState>,
    leadership_listener: SubscriptionId,
    driver: parking_lot::Mutex<Option<Driver>>,
    /// Held for the whole of `shutdown()`; `true` once it completed.
    shutdown_done: Mutex<bool>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("node_id", &self.config.local_node_id)
            .field("state", &self.state())
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

impl ServiceContext {
    /// Build the service and start following leadership.
    ///
    /// Must be called inside a Tokio runtime. The node starts as follower;
    /// use [`attach_membership`](Self::attach_membership) or
    /// [`leader`](Self::leader) to drive leadership.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn SyncTransport>,
        metrics: Arc<dyn MetricsSink>,
        logger: Logger,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RemoteClusterError::Internal(format!("no Tokio runtime: {}", e)))?;

        let config = Arc::new(config);
        let dispatch = logger.dispatch();

        let registry = Arc::new(RemoteClusterRegistry::new(Arc::clone(&store)));
        let router = Arc::new(TopicRouter::new(Arc::clone(&registry), Arc::clone(&metrics)));
        let leader = Arc::new(LeaderAffinityTracker::with_dispatch(Arc::clone(&metrics), dispatch.clone()));
        let coordinator = SyncCoordinator::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&leader),
            transport,
            Arc::clone(&metrics),
            dispatch.clone(),
        );

        let (state_tx, _) = watch::channel(ServiceState::Created);
        metrics::set_service_state(ServiceState::Created.as_str());

        // Weak: the tracker owns this listener
        let (leader_tx, leader_rx) = watch::channel(leader.is_leader());
        let weak: Weak<LeaderAffinityTracker> = Arc::downgrade(&leader);
        let leadership_listener = leader.add_listener(move || {
            if let Some(tracker) = weak.upgrade() {
                leader_tx.send_replace(tracker.is_leader());
            }
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = runtime.spawn(
            drive_leadership(coordinator.clone(), leader_rx, stop_rx).with_subscriber(dispatch),
        );

        let ctx = Self {
            config,
            metrics,
            logger,
            store,
            registry,
            router,
            leader,
            coordinator,
            state_tx,
            leadership_listener,
            driver: parking_lot::Mutex::new(Some(Driver { stop_tx, handle })),
            shutdown_done: Mutex::new(false),
        };
        ctx.set_state(ServiceState::Running);
        ctx.logger.in_scope(|| {
            info!(node_id = %ctx.config.local_node_id, "Remote cluster service running");
        });
        Ok(ctx)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RemoteClusterRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn leader(&self) -> &Arc<LeaderAffinityTracker> {
        &self.leader
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    /// Receiver for lifecycle changes.
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Called with no arguments on every leadership change.
    pub fn add_cluster_leader_changed_listener<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.leader.add_listener(listener)
    }

    pub fn remove_cluster_leader_changed_listener(&self, id: SubscriptionId) -> bool {
        self.leader.remove_listener(id)
    }

    /// Follow an external leadership source.
    pub fn attach_membership(&self, membership: Arc<dyn ClusterMembership>) {
        self.leader.attach(membership);
    }

    /// Stop everything. Safe to call more than once; later calls return
    /// once the first has finished.
    ///
    /// 1. Stop following leadership
    /// 2. Stop the coordinator (parks undelivered work)
    /// 3. Step down and detach membership
    /// 4. Close the store
    /// 5. Release the logger
    pub async fn shutdown(&self) {
        let mut done = self.shutdown_done.lock().await;
        if *done {
            return;
        }

        self.shutdown_inner().with_subscriber(self.logger.dispatch()).await;

        *done = true;
        self.logger.shutdown();
    }

    async fn shutdown_inner(&self) {
        info!(node_id = %self.config.local_node_id, "Shutting down remote cluster service");
        self.set_state(ServiceState::ShuttingDown);

        self.leader.remove_listener(self.leadership_listener);
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.stop_tx.send(true);
            let mut handle = driver.handle;
            match tokio::time::timeout(self.config.shutdown.timeout_duration(), &mut handle).await {
                Ok(Ok(())) => debug!("Leadership driver stopped"),
                Ok(Err(e)) => warn!(error = %e, "Leadership driver panicked"),
                Err(_) => {
                    handle.abort();
                    warn!("Leadership driver did not stop in time, aborting");
                }
            }
        }

        self.coordinator.stop().await;
        self.leader.shutdown().await;

        if let Err(e) = self.store.close().await {
            error!(error = %e, "Failed to close store");
        }

        self.set_state(ServiceState::Stopped);
        info!("Remote cluster service stopped");
    }

    fn set_state(&self, state: ServiceState) {
        self.state_tx.send_replace(state);
        metrics::set_service_state(state.as_str());
    }
}

/// Start or stop the coordinator to match the latest leadership state.
///
/// `start` re-checks the tracker, so a stale `true` leaves the coordinator
/// idle until the next change arrives.
async fn drive_leadership(
    coordinator: SyncCoordinator,
    mut leader_rx: watch::Receiver<bool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let want = *leader_rx.borrow_and_update();
        if want && !coordinator.is_running() {
            if let Err(e) = coordinator.start().await {
                error!(error = %e, "Failed to start coordinator, will retry");
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop_rx) => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }
        } else if !want && coordinator.is_running() {
            coordinator.stop().await;
        }

        tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            changed = leader_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Leadership driver exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::model::RemoteCluster;
    use crate::store::MemoryStore;
    use crate::transport::NoOpTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn context() -> ServiceContext {
        ServiceContext::new(
            ServiceConfig::for_testing("node-1"),
            Arc::new(MemoryStore::new()),
            Arc::new(NoOpTransport),
            Arc::new(NoopMetrics),
            Logger::disabled(),
        )
        .unwrap()
    }

    async fn wait_for_running(ctx: &ServiceContext, running: bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.coordinator().is_running() != running {
            assert!(Instant::now() < deadline, "coordinator running != {}", running);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_new_context_is_running_follower() {
        let ctx = context();
        assert_eq!(ctx.state(), ServiceState::Running);
        assert!(!ctx.is_leader());
        assert!(!ctx.coordinator().is_running());
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = ServiceConfig::for_testing("node-1");
        config.local_node_id.clear();
        let err = ServiceContext::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NoOpTransport),
            Arc::new(NoopMetrics),
            Logger::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, RemoteClusterError::Config(_)));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let err = ServiceContext::new(
            ServiceConfig::for_testing("node-1"),
            Arc::new(MemoryStore::new()),
            Arc::new(NoOpTransport),
            Arc::new(NoopMetrics),
            Logger::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, RemoteClusterError::Internal(_)));
    }

    #[tokio::test]
    async fn test_leadership_drives_coordinator() {
        let ctx = context();
        ctx.registry()
            .register(RemoteCluster::new("r1", "R1", "https://r1", "t").with_topics(["share"]))
            .await
            .unwrap();

        ctx.leader().became_leader();
        wait_for_running(&ctx, true).await;
        assert_eq!(ctx.coordinator().active_loops().await, 1);

        ctx.leader().lost_leadership();
        wait_for_running(&ctx, false).await;
        assert_eq!(ctx.coordinator().active_loops().await, 0);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_listeners_see_changes() {
        let ctx = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let id = ctx.add_cluster_leader_changed_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        ctx.leader().became_leader();
        ctx.leader().lost_leadership();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(ctx.remove_cluster_leader_changed_listener(id));
        ctx.leader().became_leader();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let ctx = context();
        ctx.leader().became_leader();
        wait_for_running(&ctx, true).await;

        ctx.shutdown().await;
        assert_eq!(ctx.state(), ServiceState::Stopped);
        assert!(!ctx.is_leader());
        assert!(ctx.logger().is_shut_down());

        ctx.shutdown().await;
        assert_eq!(ctx.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_membership_attach() {
        let ctx = context();
        let membership = Arc::new(crate::leader::ManualMembership::new(true));
        ctx.attach_membership(membership.clone());
        wait_for_running(&ctx, true).await;

        membership.set_leader(false);
        wait_for_running(&ctx, false).await;

        ctx.shutdown().await;
    }
}
