//! Fuzz target for config parsing.
//!
//! Malformed JSON or durations must come back as errors, never panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use remote_cluster::ServiceConfig;

fuzz_target!(|data: &str| {
    if let Ok(config) = ServiceConfig::from_json(data) {
        // Accepted configs yield usable durations
        let _ = config.delivery.retry_config();
        let _ = config.heartbeat.ping_interval_duration();
        let _ = config.shutdown.timeout_duration();
    }
});
