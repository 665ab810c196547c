// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Remote Cluster Service
//!
//! Every test builds a full `ServiceContext` over an in-memory (or SQLite)
//! store with a recording mock transport. No external services needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `delivery_*` - ordering, retries, dead letters
//! - `leadership_*` - follower/leader transitions
//! - `registry_*` - disable/delete while work is queued
//! - `service_*` - lifecycle, persistence, inbound routing

mod common;

use common::{eventually, patient_config, remote, RecordingMetrics, TestService};
use remote_cluster::metrics::NoopMetrics;
use remote_cluster::store::SqliteStore;
use remote_cluster::transport::{DeliveryError, NoOpTransport};
use remote_cluster::{
    DeadLetterReason, Logger, QueryFilter, RemoteClusterError, ServiceConfig, ServiceContext, ServiceState, User,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn delivery_single_task_delivered_exactly_once() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.lead().await;

    svc.ctx.coordinator().submit("R1", "share", b"hello".to_vec()).await.unwrap();

    let transport = Arc::clone(&svc.transport);
    eventually("delivery", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 1 }
    })
    .await;

    // Nothing is resent afterwards
    tokio::time::sleep(Duration::from_millis(100)).await;
    let delivered = svc.transport.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].remote_id, "R1");
    assert_eq!(delivered[0].topic, "share");
    assert_eq!(delivered[0].payload, b"hello");
    assert_eq!(svc.transport.send_count(), 1);
    assert_eq!(svc.ctx.coordinator().pending_count("R1").await, 0);
    assert!(svc.ctx.coordinator().dead_letters().is_empty());

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn delivery_fifo_preserved_across_retries() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    for payload in [b"A", b"B", b"C"] {
        svc.transport.fail_times(payload, 1, DeliveryError::transient("connection reset"));
    }
    svc.lead().await;

    for payload in ["A", "B", "C"] {
        svc.ctx
            .coordinator()
            .submit("R1", "share", payload.as_bytes().to_vec())
            .await
            .unwrap();
    }

    let transport = Arc::clone(&svc.transport);
    eventually("all delivered", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 3 }
    })
    .await;

    assert_eq!(svc.transport.sent_payloads(), vec!["A", "A", "B", "B", "C", "C"]);
    assert_eq!(svc.transport.delivered_payloads(), vec!["A", "B", "C"]);

    // Second attempt of each carries the first failure
    let attempts: Vec<u32> = svc.transport.sends().iter().map(|s| s.attempts).collect();
    assert_eq!(attempts, vec![0, 1, 0, 1, 0, 1]);

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn delivery_topics_progress_independently() {
    let svc = TestService::with_config(patient_config());
    svc.register("R1", &["slow", "fast"]).await;
    svc.transport.fail_times(b"stuck", 1000, DeliveryError::transient("busy"));
    svc.lead().await;

    let coordinator = svc.ctx.coordinator();
    coordinator.submit("R1", "slow", b"stuck".to_vec()).await.unwrap();
    coordinator.submit("R1", "slow", b"behind".to_vec()).await.unwrap();
    coordinator.submit("R1", "fast", b"f1".to_vec()).await.unwrap();
    coordinator.submit("R1", "fast", b"f2".to_vec()).await.unwrap();

    let transport = Arc::clone(&svc.transport);
    eventually("fast topic delivered", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 2 }
    })
    .await;

    assert_eq!(svc.transport.delivered_payloads(), vec!["f1", "f2"]);
    assert!(!svc.transport.sent_payloads().contains(&"behind".to_string()));
    assert_eq!(coordinator.pending_count("R1").await, 2);

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn delivery_dead_letters_after_max_attempts() {
    // for_testing: max_attempts = 3
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.transport.fail_all(Some(DeliveryError::transient("unreachable")));
    svc.lead().await;

    svc.ctx.coordinator().submit("R1", "share", b"doomed".to_vec()).await.unwrap();

    let coordinator = svc.ctx.coordinator().clone();
    eventually("dead letter", || {
        let coordinator = coordinator.clone();
        async move { coordinator.dead_letters().len() == 1 }
    })
    .await;

    let letter = &coordinator.dead_letters_for("R1")[0];
    assert_eq!(letter.reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(letter.task.attempts, 3);
    assert_eq!(letter.task.payload.as_ref(), b"doomed");
    assert!(letter.error.contains("unreachable"));

    assert_eq!(svc.transport.send_count(), 3);
    assert_eq!(coordinator.pending_count("R1").await, 0);
    assert_eq!(RecordingMetrics::get(&svc.metrics.dead_lettered), 1);
    assert_eq!(RecordingMetrics::get(&svc.metrics.failures), 3);

    // The next task in the topic is not blocked anymore
    svc.transport.fail_all(None);
    coordinator.submit("R1", "share", b"next".to_vec()).await.unwrap();
    let transport = Arc::clone(&svc.transport);
    eventually("next delivered", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_payloads() == vec!["next"] }
    })
    .await;

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn delivery_permanent_rejection_dead_letters_immediately() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.transport.fail_times(b"bad", 1, DeliveryError::permanent("payload rejected"));
    svc.lead().await;

    svc.ctx.coordinator().submit("R1", "share", b"bad".to_vec()).await.unwrap();
    svc.ctx.coordinator().submit("R1", "share", b"good".to_vec()).await.unwrap();

    let transport = Arc::clone(&svc.transport);
    eventually("good delivered", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 1 }
    })
    .await;

    let letters = svc.ctx.coordinator().dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::Rejected);
    assert_eq!(letters[0].task.attempts, 1);
    assert_eq!(svc.transport.sent_payloads(), vec!["bad", "good"]);

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn delivery_submit_as_carries_user() {
    let svc = TestService::new();
    svc.store.add_user(User::new("u1", "alice", "alice@example.com")).await;
    svc.register("R1", &["share"]).await;
    svc.lead().await;

    let err = svc
        .ctx
        .coordinator()
        .submit_as("ghost", "R1", "share", b"x".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteClusterError::UserNotFound { .. }));

    svc.ctx
        .coordinator()
        .submit_as("u1", "R1", "share", b"x".to_vec())
        .await
        .unwrap();

    let transport = Arc::clone(&svc.transport);
    eventually("delivery", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 1 }
    })
    .await;
    assert_eq!(svc.transport.delivered()[0].user_id.as_deref(), Some("u1"));

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn delivery_broadcast_fans_out_to_enabled_subscribers() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.register("R2", &["share", "other"]).await;
    svc.register("R3", &["share"]).await;
    svc.register("R4", &["other"]).await;
    svc.ctx.registry().disable("R3").await.unwrap();
    svc.lead().await;

    let ids = svc.ctx.coordinator().broadcast("share", b"news".to_vec()).await.unwrap();
    assert_eq!(ids.len(), 2);

    let transport = Arc::clone(&svc.transport);
    eventually("fan-out", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 2 }
    })
    .await;

    let mut targets: Vec<String> = svc.transport.delivered().into_iter().map(|s| s.remote_id).collect();
    targets.sort();
    assert_eq!(targets, vec!["R1", "R2"]);

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn delivery_submit_validates_target() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    let coordinator = svc.ctx.coordinator();

    assert!(matches!(
        coordinator.submit("nope", "share", b"x".to_vec()).await,
        Err(RemoteClusterError::NotFound { .. })
    ));
    assert!(matches!(
        coordinator.submit("R1", "unsubscribed", b"x".to_vec()).await,
        Err(RemoteClusterError::Validation(_))
    ));

    svc.ctx.registry().disable("R1").await.unwrap();
    assert!(matches!(
        coordinator.submit("R1", "share", b"x".to_vec()).await,
        Err(RemoteClusterError::Validation(_))
    ));

    svc.ctx.shutdown().await;
}

// =============================================================================
// Leadership
// =============================================================================

#[tokio::test]
async fn leadership_follower_to_leader_starts_one_loop_per_enabled_remote() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.register("R2", &["share"]).await;
    svc.register("R3", &["share"]).await;
    svc.ctx.registry().disable("R3").await.unwrap();

    assert!(!svc.ctx.coordinator().is_running());
    assert_eq!(svc.ctx.coordinator().active_loops().await, 0);

    svc.lead().await;
    assert_eq!(svc.ctx.coordinator().active_loops().await, 2);

    // A second notification changes nothing
    svc.ctx.leader().became_leader();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(svc.ctx.coordinator().active_loops().await, 2);

    svc.ctx.coordinator().submit("R2", "share", b"x".to_vec()).await.unwrap();
    let transport = Arc::clone(&svc.transport);
    eventually("throughput", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 1 }
    })
    .await;

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn leadership_loss_parks_work_until_reelection() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.lead().await;
    svc.follow().await;

    svc.ctx.coordinator().submit("R1", "share", b"one".to_vec()).await.unwrap();
    svc.ctx.coordinator().submit("R1", "share", b"two".to_vec()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(svc.transport.send_count(), 0, "followers never deliver");
    assert_eq!(svc.ctx.coordinator().pending_count("R1").await, 2);
    assert_eq!(svc.ctx.coordinator().health().await.parked_tasks, 2);

    svc.lead().await;
    let transport = Arc::clone(&svc.transport);
    eventually("parked work delivered", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 2 }
    })
    .await;
    assert_eq!(svc.transport.delivered_payloads(), vec!["one", "two"]);
    assert_eq!(svc.ctx.coordinator().pending_count("R1").await, 0);

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn leadership_loss_keeps_retrying_task_state() {
    let svc = TestService::with_config(patient_config());
    svc.register("R1", &["share"]).await;
    svc.transport.fail_all(Some(DeliveryError::transient("down")));
    svc.lead().await;

    svc.ctx.coordinator().submit("R1", "share", b"x".to_vec()).await.unwrap();
    let transport = Arc::clone(&svc.transport);
    eventually("a few failures", || {
        let transport = Arc::clone(&transport);
        async move { transport.send_count() >= 2 }
    })
    .await;

    svc.follow().await;
    let sends_when_stopped = svc.transport.send_count();
    assert_eq!(svc.ctx.coordinator().pending_count("R1").await, 1);

    svc.transport.fail_all(None);
    svc.lead().await;
    eventually("delivered after re-election", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 1 }
    })
    .await;

    // Attempt count survived the stop
    let last = svc.transport.delivered().pop().unwrap();
    assert!(last.attempts as usize >= sends_when_stopped);

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn leadership_new_registration_gets_a_loop() {
    let svc = TestService::new();
    svc.lead().await;
    assert_eq!(svc.ctx.coordinator().active_loops().await, 0);

    svc.register("R1", &["share"]).await;
    let coordinator = svc.ctx.coordinator().clone();
    eventually("loop for new remote", || {
        let coordinator = coordinator.clone();
        async move { coordinator.active_loops().await == 1 }
    })
    .await;

    svc.ctx.shutdown().await;
}

// =============================================================================
// Registry changes with queued work
// =============================================================================

#[tokio::test]
async fn registry_disable_purges_pending_tasks() {
    let svc = TestService::with_config(patient_config());
    svc.register("R1", &["share"]).await;
    svc.transport.fail_all(Some(DeliveryError::transient("down")));
    svc.lead().await;

    svc.ctx.coordinator().submit("R1", "share", b"t1".to_vec()).await.unwrap();
    svc.ctx.coordinator().submit("R1", "share", b"t2".to_vec()).await.unwrap();
    let coordinator = svc.ctx.coordinator().clone();
    assert_eq!(coordinator.pending_count("R1").await, 2);

    svc.ctx.registry().disable("R1").await.unwrap();

    eventually("purge", || {
        let coordinator = coordinator.clone();
        async move { coordinator.pending_count("R1").await == 0 }
    })
    .await;

    assert_eq!(RecordingMetrics::get(&svc.metrics.purged), 2);
    assert_eq!(svc.transport.delivered_count(), 0);
    assert!(coordinator.dead_letters().is_empty());

    // Nothing is attempted afterwards, even once sends would succeed
    svc.transport.fail_all(None);
    let sends = svc.transport.send_count();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(svc.transport.send_count(), sends);

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn registry_unsubscribed_topic_is_purged() {
    let mut config = patient_config();
    config.delivery.initial_backoff = "300ms".to_string();
    config.delivery.max_backoff = "300ms".to_string();
    let svc = TestService::with_config(config);
    svc.register("R1", &["share", "other"]).await;
    svc.transport.fail_times(b"A", 1, DeliveryError::transient("blip"));
    svc.lead().await;

    let coordinator = svc.ctx.coordinator().clone();
    coordinator.submit("R1", "share", b"A".to_vec()).await.unwrap();
    let transport = Arc::clone(&svc.transport);
    eventually("first attempt failed", || {
        let transport = Arc::clone(&transport);
        async move { transport.send_count() == 1 }
    })
    .await;

    // A sits in backoff when the subscription goes away
    svc.ctx.registry().update_topics("R1", ["other"]).await.unwrap();
    assert!(matches!(
        coordinator.submit("R1", "share", b"C".to_vec()).await,
        Err(RemoteClusterError::Validation(_))
    ));
    coordinator.submit("R1", "other", b"B".to_vec()).await.unwrap();

    eventually("unsubscribed topic purged", || {
        let coordinator = coordinator.clone();
        async move { coordinator.pending_count("R1").await == 0 }
    })
    .await;

    // Well past A's retry time
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(svc.transport.delivered_payloads(), vec!["B".to_string()]);
    assert_eq!(svc.transport.send_count(), 2);
    assert_eq!(RecordingMetrics::get(&svc.metrics.purged), 1);
    assert!(coordinator.dead_letters().is_empty());

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn registry_disable_twice_equals_once() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    let mut events = svc.ctx.registry().subscribe();

    svc.ctx.registry().disable("R1").await.unwrap();
    svc.ctx.registry().disable("R1").await.unwrap();

    let rc = svc.ctx.registry().get("R1").await.unwrap();
    assert!(!rc.enabled);
    assert!(events.try_recv().is_ok());
    assert!(events.try_recv().is_err());

    assert!(svc.ctx.router().remotes_for_topic("share").await.unwrap().is_empty());
    assert_eq!(
        svc.ctx.registry().get_all(&QueryFilter::default()).await.unwrap().len(),
        1
    );

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn registry_delete_purges_pending_tasks() {
    let svc = TestService::with_config(patient_config());
    svc.register("R1", &["share"]).await;
    svc.transport.fail_all(Some(DeliveryError::transient("down")));
    svc.lead().await;

    svc.ctx.coordinator().submit("R1", "share", b"t1".to_vec()).await.unwrap();
    assert!(svc.ctx.registry().delete("R1").await.unwrap());

    let coordinator = svc.ctx.coordinator().clone();
    eventually("purge and retire", || {
        let coordinator = coordinator.clone();
        async move { coordinator.pending_count("R1").await == 0 && coordinator.active_loops().await == 0 }
    })
    .await;
    assert_eq!(RecordingMetrics::get(&svc.metrics.purged), 1);
    assert!(coordinator.dead_letters().is_empty());

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn registry_parked_work_for_disabled_remote_is_purged_on_start() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;

    svc.ctx.coordinator().submit("R1", "share", b"x".to_vec()).await.unwrap();
    svc.ctx.registry().disable("R1").await.unwrap();

    svc.lead().await;
    let coordinator = svc.ctx.coordinator().clone();
    eventually("parked purge", || {
        let coordinator = coordinator.clone();
        async move { coordinator.pending_count("R1").await == 0 }
    })
    .await;

    assert_eq!(svc.transport.send_count(), 0);
    assert_eq!(RecordingMetrics::get(&svc.metrics.purged), 1);

    svc.ctx.shutdown().await;
}

// =============================================================================
// Heartbeat
// =============================================================================

#[tokio::test]
async fn heartbeat_updates_last_ping() {
    let mut config = ServiceConfig::for_testing("test-node");
    config.heartbeat.enabled = true;
    config.heartbeat.ping_interval = "20ms".to_string();
    let svc = TestService::with_config(config);
    svc.register("R1", &["share"]).await;
    assert_eq!(svc.ctx.registry().get("R1").await.unwrap().last_ping_at, 0);

    svc.lead().await;

    let registry = Arc::clone(svc.ctx.registry());
    eventually("heartbeat recorded", || {
        let registry = Arc::clone(&registry);
        async move { registry.get("R1").await.unwrap().last_ping_at > 0 }
    })
    .await;
    assert!(RecordingMetrics::get(&svc.metrics.heartbeats_ok) >= 1);

    let rc = svc.ctx.registry().get("R1").await.unwrap();
    assert!(rc.is_online(remote_cluster::model::now_millis(), Duration::from_secs(60)));

    svc.transport.set_ping_fails(true);
    let metrics = Arc::clone(&svc.metrics);
    eventually("heartbeat failure counted", || {
        let metrics = Arc::clone(&metrics);
        async move { RecordingMetrics::get(&metrics.heartbeats_failed) >= 1 }
    })
    .await;

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn heartbeat_only_while_leader() {
    let mut config = ServiceConfig::for_testing("test-node");
    config.heartbeat.enabled = true;
    config.heartbeat.ping_interval = "20ms".to_string();
    let svc = TestService::with_config(config);
    svc.register("R1", &["share"]).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(svc.transport.ping_count(), 0);

    svc.ctx.shutdown().await;
}

// =============================================================================
// Service
// =============================================================================

#[tokio::test]
async fn service_shutdown_twice_is_noop() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.lead().await;

    svc.ctx.shutdown().await;
    assert_eq!(svc.ctx.state(), ServiceState::Stopped);
    assert!(!svc.ctx.coordinator().is_running());
    assert!(svc.store.is_closed());

    svc.ctx.shutdown().await;
    assert_eq!(svc.ctx.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn service_leadership_after_shutdown_is_ignored() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.ctx.shutdown().await;

    svc.ctx.leader().became_leader();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!svc.ctx.is_leader());
    assert!(!svc.ctx.coordinator().is_running());
}

#[tokio::test]
async fn service_inbound_dispatch() {
    let svc = TestService::new();
    let received = Arc::new(AtomicUsize::new(0));

    let r = Arc::clone(&received);
    svc.ctx
        .router()
        .register_handler("share", move |remote_id, payload| {
            assert_eq!(remote_id, "R1");
            assert_eq!(payload, b"inbound");
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    assert!(matches!(
        svc.ctx.router().register_handler("share", |_, _| Ok(())),
        Err(RemoteClusterError::Conflict { .. })
    ));

    svc.ctx.router().dispatch("share", "R1", b"inbound").unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 1);

    assert!(matches!(
        svc.ctx.router().dispatch("unknown", "R1", b"x"),
        Err(RemoteClusterError::Unroutable { .. })
    ));
    assert_eq!(RecordingMetrics::get(&svc.metrics.unroutable), 1);

    svc.ctx.shutdown().await;
}

#[tokio::test]
async fn service_sqlite_registry_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("remote_clusters.db");

    {
        let store = SqliteStore::open_path(&path).await.unwrap();
        store.save_user(&User::new("u1", "alice", "alice@example.com")).await.unwrap();
        let ctx = ServiceContext::new(
            ServiceConfig::for_testing("node-1"),
            Arc::new(store),
            Arc::new(NoOpTransport),
            Arc::new(NoopMetrics),
            Logger::disabled(),
        )
        .unwrap();

        ctx.registry()
            .register(remote("R1", &["share", "other"]).with_creator("u1"))
            .await
            .unwrap();
        ctx.registry().register(remote("R2", &["shared"])).await.unwrap();
        ctx.registry().disable("R2").await.unwrap();
        ctx.shutdown().await;
    }

    let store = SqliteStore::open_path(&path).await.unwrap();
    let ctx = ServiceContext::new(
        ServiceConfig::for_testing("node-1"),
        Arc::new(store),
        Arc::new(NoOpTransport),
        Arc::new(NoopMetrics),
        Logger::disabled(),
    )
    .unwrap();

    let r1 = ctx.registry().get("R1").await.unwrap();
    assert!(r1.subscribes_to("share"));
    assert!(r1.subscribes_to("other"));
    assert_eq!(r1.creator_id.as_deref(), Some("u1"));
    assert_eq!(r1.token, "token-R1");

    // "share" must not match the "shared" subscription
    let ids: Vec<String> = ctx
        .router()
        .remotes_for_topic("share")
        .await
        .unwrap()
        .into_iter()
        .map(|rc| rc.remote_id)
        .collect();
    assert_eq!(ids, vec!["R1"]);

    assert!(!ctx.registry().get("R2").await.unwrap().enabled);

    ctx.shutdown().await;
}

#[tokio::test]
async fn service_health_reports_delivery() {
    let svc = TestService::new();
    svc.register("R1", &["share"]).await;
    svc.transport.fail_times(b"x", 1, DeliveryError::transient("blip"));
    svc.lead().await;

    svc.ctx.coordinator().submit("R1", "share", b"x".to_vec()).await.unwrap();
    let transport = Arc::clone(&svc.transport);
    eventually("delivered", || {
        let transport = Arc::clone(&transport);
        async move { transport.delivered_count() == 1 }
    })
    .await;

    let health = svc.ctx.coordinator().health().await;
    assert!(health.ready());
    assert_eq!(health.active_loops, 1);
    assert_eq!(health.pending_tasks, 0);
    let r1 = &health.remotes[0];
    assert_eq!(r1.remote_id, "R1");
    assert_eq!(r1.delivered, 1);
    assert_eq!(r1.consecutive_failures, 0);
    assert!(r1.last_success_at.is_some());
    assert!(r1.last_error.as_deref().unwrap_or_default().contains("blip"));

    svc.ctx.shutdown().await;
}
