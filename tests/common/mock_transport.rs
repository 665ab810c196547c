//! Mock SyncTransport for testing.
//!
//! Records every send attempt and every successful delivery. Failures can
//! be scripted per payload, applied to all sends, or the transport can be
//! wedged so sends never complete.

use parking_lot::Mutex;
use remote_cluster::transport::{DeliveryError, SyncTransport, TransportFuture};
use remote_cluster::{RemoteCluster, SyncTask};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A recorded send() call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCall {
    pub remote_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub user_id: Option<String>,
    /// Failed attempts before this one.
    pub attempts: u32,
}

impl SendCall {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Mock implementation of SyncTransport that records all calls.
///
/// # Example
/// ```rust,ignore
/// let mock = MockTransport::new();
///
/// // Fail "A" once, then let it through
/// mock.fail_times(b"A", 1, DeliveryError::transient("reset"));
///
/// // Use in tests...
///
/// assert_eq!(mock.delivered_payloads(), vec!["A"]);
/// ```
#[derive(Default)]
pub struct MockTransport {
    /// Every send() attempt, in order
    sends: Mutex<Vec<SendCall>>,
    /// Successful sends, in order
    delivered: Mutex<Vec<SendCall>>,
    /// Scripted failures keyed by payload
    scripted: Mutex<HashMap<Vec<u8>, VecDeque<DeliveryError>>>,
    /// Failure returned for every send when set
    fail_all: Mutex<Option<DeliveryError>>,
    /// Sends never resolve while set
    wedged: AtomicBool,
    /// Sends currently inside send()
    in_flight: AtomicUsize,
    pings: AtomicUsize,
    ping_fails: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` sends of `payload` with `error`.
    pub fn fail_times(&self, payload: &[u8], times: usize, error: DeliveryError) {
        let mut scripted = self.scripted.lock();
        let queue = scripted.entry(payload.to_vec()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn fail_all(&self, error: Option<DeliveryError>) {
        *self.fail_all.lock() = error;
    }

    pub fn set_wedged(&self, wedged: bool) {
        self.wedged.store(wedged, Ordering::SeqCst);
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<SendCall> {
        self.sends.lock().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().len()
    }

    pub fn delivered(&self) -> Vec<SendCall> {
        self.delivered.lock().clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn delivered_payloads(&self) -> Vec<String> {
        self.delivered.lock().iter().map(SendCall::payload_str).collect()
    }

    pub fn sent_payloads(&self) -> Vec<String> {
        self.sends.lock().iter().map(SendCall::payload_str).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    fn next_failure(&self, payload: &[u8]) -> Option<DeliveryError> {
        if let Some(err) = self.fail_all.lock().clone() {
            return Some(err);
        }
        self.scripted
            .lock()
            .get_mut(payload)
            .and_then(VecDeque::pop_front)
    }
}

/// Decrements the in-flight count even if the send future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SyncTransport for MockTransport {
    fn send<'a>(&'a self, remote: &'a RemoteCluster, task: &'a SyncTask) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let call = SendCall {
                remote_id: remote.remote_id.clone(),
                topic: task.topic.clone(),
                payload: task.payload.to_vec(),
                user_id: task.user_id.clone(),
                attempts: task.attempts,
            };
            self.sends.lock().push(call.clone());

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            while self.wedged.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            if let Some(err) = self.next_failure(&call.payload) {
                return Err(err);
            }
            self.delivered.lock().push(call);
            Ok(())
        })
    }

    fn ping<'a>(&'a self, _remote: &'a RemoteCluster) -> TransportFuture<'a, Duration> {
        Box::pin(async move {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.ping_fails.load(Ordering::SeqCst) {
                return Err(DeliveryError::transient("ping refused"));
            }
            Ok(Duration::from_millis(1))
        })
    }
}
