//! # Remote Cluster
//!
//! Coordination for server-to-server sync between independent deployments.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             ServiceContext                                │
//! │                                                                           │
//! │  ┌──────────────────┐   ┌─────────────┐   ┌────────────────────────────┐  │
//! │  │ LeaderAffinity   │──►│ Sync        │──►│ delivery loop (per remote) │──┼──► SyncTransport
//! │  │ Tracker          │   │ Coordinator │   │ FIFO per topic, backoff    │  │
//! │  └──────────────────┘   └─────────────┘   └────────────────────────────┘  │
//! │                                │                                          │
//! │                                ▼                                          │
//! │  ┌──────────────────┐   ┌─────────────────────┐   ┌──────────────────┐    │
//! │  │ TopicRouter      │──►│ RemoteCluster       │──►│ Store            │    │
//! │  │ (in / out)       │   │ Registry            │   │ (memory, SQLite) │    │
//! │  └──────────────────┘   └─────────────────────┘   └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the cluster leader delivers. When leadership arrives the coordinator
//! starts one delivery loop per enabled remote; when it leaves, loops stop
//! and their queues are parked until the next term.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use remote_cluster::{Logger, RemoteCluster, ServiceConfig, ServiceContext};
//! use remote_cluster::metrics::PrometheusMetrics;
//! use remote_cluster::store::MemoryStore;
//! use remote_cluster::transport::NoOpTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> remote_cluster::Result<()> {
//!     let config = ServiceConfig::default();
//!     let logger = Logger::new(&config.logging)?;
//!     let ctx = ServiceContext::new(
//!         config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(NoOpTransport),
//!         Arc::new(PrometheusMetrics),
//!         logger,
//!     )?;
//!
//!     ctx.registry()
//!         .register(RemoteCluster::new("r1", "Remote 1", "https://r1.example.com", "token").with_topics(["share"]))
//!         .await?;
//!
//!     ctx.leader().became_leader();
//!     ctx.coordinator().broadcast("share", b"hello".to_vec()).await?;
//!
//!     ctx.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod leader;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod service;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::{DeliveryConfig, HeartbeatConfig, LoggingConfig, ServiceConfig, ShutdownConfig, StoreConfig};
pub use coordinator::{CoordinatorHealth, DeadLetter, DeadLetterReason, RemoteHealth, SyncCoordinator, SyncTask, TaskId};
pub use error::{RemoteClusterError, Result};
pub use leader::{ClusterMembership, LeaderAffinityTracker, LeadershipState, ManualMembership, SubscriptionId};
pub use logging::Logger;
pub use model::{QueryFilter, RemoteCluster, User};
pub use registry::{RegistryEvent, RemoteClusterRegistry};
pub use router::{InboundHandler, TopicRouter};
pub use service::{ServiceContext, ServiceState};
pub use store::{MemoryStore, SqliteStore, Store};
pub use transport::{DeliveryError, NoOpTransport, SyncTransport};
