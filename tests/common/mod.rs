//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A recording mock SyncTransport
//! - A counting MetricsSink
//! - Context construction and polling helpers

#![allow(dead_code)]

pub mod mock_metrics;
pub mod mock_transport;

pub use mock_metrics::*;
pub use mock_transport::*;

use remote_cluster::store::Store;
use remote_cluster::{Logger, MemoryStore, RemoteCluster, ServiceConfig, ServiceContext};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A context plus handles to its mocks.
pub struct TestService {
    pub ctx: ServiceContext,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<MockTransport>,
    pub metrics: Arc<RecordingMetrics>,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::for_testing("test-node"))
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_store(config, store)
    }

    pub fn with_store(config: ServiceConfig, store: Arc<MemoryStore>) -> Self {
        let transport = Arc::new(MockTransport::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let ctx = ServiceContext::new(
            config,
            Arc::clone(&store) as Arc<dyn Store>,
            transport.clone(),
            metrics.clone(),
            Logger::disabled(),
        )
        .expect("context");
        Self {
            ctx,
            store,
            transport,
            metrics,
        }
    }

    pub async fn register(&self, remote_id: &str, topics: &[&str]) -> RemoteCluster {
        self.ctx
            .registry()
            .register(remote(remote_id, topics))
            .await
            .expect("register")
    }

    /// Become leader and wait for the coordinator to start.
    pub async fn lead(&self) {
        self.ctx.leader().became_leader();
        let coordinator = self.ctx.coordinator().clone();
        eventually("coordinator running", || {
            let coordinator = coordinator.clone();
            async move { coordinator.is_running() }
        })
        .await;
    }

    /// Step down and wait for every loop to exit.
    pub async fn follow(&self) {
        self.ctx.leader().lost_leadership();
        let coordinator = self.ctx.coordinator().clone();
        eventually("coordinator stopped", || {
            let coordinator = coordinator.clone();
            async move { !coordinator.is_running() && coordinator.active_loops().await == 0 }
        })
        .await;
    }
}

pub fn remote(remote_id: &str, topics: &[&str]) -> RemoteCluster {
    RemoteCluster::new(
        remote_id,
        format!("Remote {}", remote_id),
        format!("https://{}.example.com", remote_id),
        format!("token-{}", remote_id),
    )
    .with_topics(topics.iter().copied())
}

/// Config with fast backoff that never gives up.
pub fn patient_config() -> ServiceConfig {
    let mut config = ServiceConfig::for_testing("test-node");
    config.delivery.max_attempts = 1000;
    config.delivery.initial_backoff = "20ms".to_string();
    config.delivery.max_backoff = "50ms".to_string();
    config
}

/// Poll `check` until it holds, failing the test after 5 seconds.
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for: {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
