//! Fuzz target for topic normalization and storage encoding.
//!
//! Normalization must never panic, and anything it accepts must survive
//! the padded storage encoding unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use remote_cluster::model::{decode_topics, encode_topics, normalize_topic};
use std::collections::BTreeSet;

fuzz_target!(|data: (&str, &str)| {
    let (raw, encoded) = data;

    // Arbitrary stored strings decode without panicking
    let _ = decode_topics(encoded);

    if let Ok(topic) = normalize_topic(raw) {
        assert!(!topic.is_empty());
        assert!(!topic.chars().any(char::is_whitespace));

        let set: BTreeSet<String> = [topic].into_iter().collect();
        let stored = encode_topics(&set);
        assert!(stored.starts_with(' ') && stored.ends_with(' '));
        assert_eq!(decode_topics(&stored), set);
    }
});
