//! Heartbeat task: pings every enabled remote while this node leads.

use super::{stopped, CoordinatorInner};
use crate::model::{now_millis, QueryFilter, RemoteCluster};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

pub(super) async fn run_heartbeat(inner: Arc<CoordinatorInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = inner.heartbeat.ping_interval_duration();
    let span = info_span!("heartbeat");

    async move {
        info!(interval_ms = interval.as_millis() as u64, "Starting heartbeat task");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown_rx) => break,
                _ = timer.tick() => {
                    if !ping_all(&inner, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        info!("Heartbeat task stopped");
    }
    .instrument(span)
    .await
}

/// One round. Returns false if stop arrived mid-round.
async fn ping_all(inner: &CoordinatorInner, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let remotes = match inner.registry.get_all(&QueryFilter::enabled()).await {
        Ok(remotes) => remotes,
        Err(e) => {
            warn!(error = %e, "Failed to list remotes for heartbeat");
            return true;
        }
    };

    // Concurrent, each bounded by the send timeout
    let pings = remotes.iter().map(|remote| async move {
        let result = tokio::time::timeout(inner.send_timeout, inner.transport.ping(remote)).await;
        (remote, result)
    });
    let results = tokio::select! {
        biased;
        _ = stopped(shutdown_rx) => return false,
        results = join_all(pings) => results,
    };

    for (remote, result) in results {
        match result {
            Ok(Ok(rtt)) => {
                if let Err(e) = inner.registry.update_heartbeat(&remote.remote_id).await {
                    // Deleted between listing and ping
                    debug!(remote_id = %remote.remote_id, error = %e, "Could not record heartbeat");
                }
                inner.metrics.heartbeat(&remote.remote_id, true);
                inner.metrics.ping_latency(&remote.remote_id, rtt);
                debug!(remote_id = %remote.remote_id, rtt_ms = rtt.as_millis() as u64, "Remote ping ok");
            }
            Ok(Err(e)) => {
                inner.metrics.heartbeat(&remote.remote_id, false);
                warn!(remote_id = %remote.remote_id, error = %e, "Remote ping failed");
                report_if_offline(inner, remote);
            }
            Err(_) => {
                inner.metrics.heartbeat(&remote.remote_id, false);
                warn!(
                    remote_id = %remote.remote_id,
                    timeout_ms = inner.send_timeout.as_millis() as u64,
                    "Remote ping timed out"
                );
                report_if_offline(inner, remote);
            }
        }
    }
    true
}

fn report_if_offline(inner: &CoordinatorInner, remote: &RemoteCluster) {
    let threshold = inner.heartbeat.online_threshold_duration();
    if !remote.is_online(now_millis(), threshold) {
        warn!(
            remote_id = %remote.remote_id,
            last_ping_at = remote.last_ping_at,
            threshold_ms = threshold.as_millis() as u64,
            "Remote is offline"
        );
    }
}
