// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Leader affinity.
//!
//! Only the cluster leader drives outbound sync. [`LeaderAffinityTracker`]
//! holds the local leadership flag and fans transitions out to listeners.
//!
//! # State Machine
//!
//! ```text
//!            became_leader()
//!  Follower ─────────────────► Leader
//!     ▲                          │
//!     └──────────────────────────┘
//!            lost_leadership()
//! ```
//!
//! Repeating the current state is a no-op and notifies nobody.
//!
//! # Listener Semantics
//!
//! - Listeners run synchronously on the transitioning thread, in
//!   registration order ([`SubscriptionId`]s are monotonic).
//! - Each pass iterates a snapshot, so adding or removing a listener from
//!   inside a listener takes effect on the next transition.
//! - A panicking listener is caught, logged and counted. The rest still run.

use crate::metrics::MetricsSink;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

/// Handle returned by [`LeaderAffinityTracker::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked on every leadership transition.
pub type LeaderListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Follower,
    Leader,
}

impl std::fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Follower => write!(f, "Follower"),
            Self::Leader => write!(f, "Leader"),
        }
    }
}

/// Source of cluster leadership, typically backed by the HA layer.
pub trait ClusterMembership: Send + Sync + 'static {
    fn is_leader(&self) -> bool;

    /// Current leadership, updated on every change.
    fn leadership(&self) -> watch::Receiver<bool>;
}

/// Membership driven by hand. For standalone deployments and tests.
#[derive(Debug)]
pub struct ManualMembership {
    tx: watch::Sender<bool>,
}

impl ManualMembership {
    pub fn new(is_leader: bool) -> Self {
        let (tx, _) = watch::channel(is_leader);
        Self { tx }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.tx.send_replace(is_leader);
    }
}

impl ClusterMembership for ManualMembership {
    fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    fn leadership(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

struct Bridge {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Tracks local leadership and notifies listeners on change.
pub struct LeaderAffinityTracker {
    is_leader: AtomicBool,
    listeners: RwLock<BTreeMap<SubscriptionId, LeaderListener>>,
    next_id: AtomicU64,
    /// Serializes transitions; reentrant so a listener may transition.
    transition: ReentrantMutex<()>,
    shut_down: AtomicBool,
    bridge: Mutex<Option<Bridge>>,
    metrics: Arc<dyn MetricsSink>,
    dispatch: Dispatch,
}

impl std::fmt::Debug for LeaderAffinityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderAffinityTracker")
            .field("state", &self.state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl LeaderAffinityTracker {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self::with_dispatch(metrics, tracing::dispatcher::get_default(Dispatch::clone))
    }

    /// Tracker whose bridge task logs through `dispatch`.
    pub fn with_dispatch(metrics: Arc<dyn MetricsSink>, dispatch: Dispatch) -> Self {
        Self {
            is_leader: AtomicBool::new(false),
            listeners: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            transition: ReentrantMutex::new(()),
            shut_down: AtomicBool::new(false),
            bridge: Mutex::new(None),
            metrics,
            dispatch,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LeadershipState {
        if self.is_leader() {
            LeadershipState::Leader
        } else {
            LeadershipState::Follower
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Register a listener. It is not called for the current state.
    pub fn add_listener<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(id, Arc::new(listener));
        debug!(subscription = %id, "Added leadership listener");
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// Follower → Leader. Returns whether a transition happened.
    pub fn became_leader(&self) -> bool {
        self.set_leader(true)
    }

    /// Leader → Follower. Returns whether a transition happened.
    pub fn lost_leadership(&self) -> bool {
        self.set_leader(false)
    }

    /// Move to the given state, notifying listeners if it changed.
    pub fn set_leader(&self, is_leader: bool) -> bool {
        let _transition = self.transition.lock();

        if is_leader && self.shut_down.load(Ordering::Acquire) {
            warn!("Ignoring leadership gain after tracker shutdown");
            return false;
        }

        if self.is_leader.swap(is_leader, Ordering::AcqRel) == is_leader {
            return false;
        }

        info!(state = %self.state(), "Leadership changed");
        crate::metrics::record_leadership_change(is_leader);
        self.notify();
        true
    }

    fn notify(&self) {
        let snapshot: Vec<(SubscriptionId, LeaderListener)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                error!(subscription = %id, "Leadership listener panicked");
                self.metrics.listener_panic();
            }
        }
    }

    /// Follow `membership`, driving transitions from its leadership feed.
    ///
    /// Replaces any previously attached membership. Must be called inside
    /// a Tokio runtime.
    pub fn attach(self: &Arc<Self>, membership: Arc<dyn ClusterMembership>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut leadership = membership.leadership();
        let tracker: Weak<Self> = Arc::downgrade(self);

        let task = async move {
            let initial = *leadership.borrow_and_update();
            if let Some(tracker) = tracker.upgrade() {
                tracker.set_leader(initial);
            }

            loop {
                tokio::select! {
                    biased;

                    _ = stop_rx.changed() => break,

                    changed = leadership.changed() => {
                        if changed.is_err() {
                            debug!("Membership feed closed");
                            break;
                        }
                        let is_leader = *leadership.borrow_and_update();
                        match tracker.upgrade() {
                            Some(tracker) => { tracker.set_leader(is_leader); }
                            None => break,
                        }
                    }
                }
            }
        };

        let handle = tokio::spawn(task.with_subscriber(self.dispatch.clone()));

        if let Some(old) = self.bridge.lock().replace(Bridge { stop_tx, handle }) {
            old.handle.abort();
        }
    }

    /// Stop following membership and step down.
    ///
    /// Listeners are notified if this node was leader. Later leadership
    /// gains are ignored.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);

        let bridge = self.bridge.lock().take();
        if let Some(bridge) = bridge {
            let _ = bridge.stop_tx.send(true);
            let mut handle = bridge.handle;
            if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                warn!("Membership bridge did not stop in time, aborting");
                handle.abort();
            }
        }

        self.set_leader(false);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
