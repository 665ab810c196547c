// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry data model.
//!
//! # Topic Encoding
//!
//! A remote's topic set is persisted as one space-delimited string padded
//! with a space on both ends:
//!
//! ```text
//! {"share", "other"}  →  " other share "
//! ```
//!
//! so a whole-word match is `LIKE '% share %'` and `"sha"` never matches
//! `"share"`. Topic names are therefore trimmed and may not contain
//! whitespace.

use crate::error::{RemoteClusterError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::time::Duration;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize a topic name, rejecting empty or whitespace-bearing names.
pub fn normalize_topic(raw: &str) -> Result<String> {
    let topic = raw.trim();
    if topic.is_empty() {
        return Err(RemoteClusterError::validation("topic name must not be empty"));
    }
    if topic.chars().any(char::is_whitespace) {
        return Err(RemoteClusterError::validation(format!(
            "topic name '{}' must not contain whitespace",
            topic
        )));
    }
    Ok(topic.to_string())
}

/// Encode a topic set in its padded storage form.
pub fn encode_topics(topics: &BTreeSet<String>) -> String {
    if topics.is_empty() {
        return String::new();
    }
    let mut encoded = String::from(" ");
    for topic in topics {
        encoded.push_str(topic);
        encoded.push(' ');
    }
    encoded
}

/// Decode the padded storage form back into a topic set.
pub fn decode_topics(encoded: &str) -> BTreeSet<String> {
    encoded.split_whitespace().map(str::to_string).collect()
}

/// A remote peer known to this cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCluster {
    pub remote_id: String,
    pub display_name: String,
    pub site_url: String,
    /// Shared auth token. Never logged; see [`token_fingerprint`](Self::token_fingerprint).
    pub token: String,
    pub topics: BTreeSet<String>,
    /// User the registration is attributed to.
    pub creator_id: Option<String>,
    /// Epoch millis, assigned at registration.
    pub create_at: i64,
    /// Epoch millis of the last successful ping, 0 if never.
    pub last_ping_at: i64,
    pub enabled: bool,
}

impl std::fmt::Debug for RemoteCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCluster")
            .field("remote_id", &self.remote_id)
            .field("display_name", &self.display_name)
            .field("site_url", &self.site_url)
            .field("token", &self.token_fingerprint())
            .field("topics", &self.topics)
            .field("creator_id", &self.creator_id)
            .field("create_at", &self.create_at)
            .field("last_ping_at", &self.last_ping_at)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl RemoteCluster {
    /// A new, enabled remote with no topics.
    pub fn new(
        remote_id: impl Into<String>,
        display_name: impl Into<String>,
        site_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            display_name: display_name.into(),
            site_url: site_url.into(),
            token: token.into(),
            topics: BTreeSet::new(),
            creator_id: None,
            create_at: 0,
            last_ping_at: 0,
            enabled: true,
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_creator(mut self, user_id: impl Into<String>) -> Self {
        self.creator_id = Some(user_id.into());
        self
    }

    pub fn subscribes_to(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// True if the remote answered a ping within `threshold` of `now_ms`.
    pub fn is_online(&self, now_ms: i64, threshold: Duration) -> bool {
        if self.last_ping_at <= 0 {
            return false;
        }
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.last_ping_at) <= threshold_ms
    }

    /// First 8 hex chars of the token's SHA-256, safe to log.
    pub fn token_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(8);
        hex
    }

    /// The topic set in storage form.
    pub fn encoded_topics(&self) -> String {
        encode_topics(&self.topics)
    }

    /// Check fields a registration must carry.
    ///
    /// Normalizes topic names in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.remote_id.trim().is_empty() {
            return Err(RemoteClusterError::validation("remote_id is required"));
        }
        if self.remote_id.chars().any(char::is_whitespace) {
            return Err(RemoteClusterError::validation(format!(
                "remote_id '{}' must not contain whitespace",
                self.remote_id
            )));
        }
        if self.site_url.trim().is_empty() {
            return Err(RemoteClusterError::validation("site_url is required"));
        }
        self.topics = normalize_topic_set(std::mem::take(&mut self.topics))?;
        Ok(())
    }
}

/// Normalize every topic in a set.
pub fn normalize_topic_set<I, S>(topics: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    topics
        .into_iter()
        .map(|t| normalize_topic(t.as_ref()))
        .collect()
}

/// Predicate over remote records.
///
/// The default filter matches everything, disabled records included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Only remotes subscribed to this topic.
    pub topic: Option<String>,
    /// Skip soft-deleted remotes.
    pub enabled_only: bool,
    /// Remote IDs to leave out.
    pub exclude_ids: BTreeSet<String>,
    /// Only remotes registered by this user.
    pub creator_id: Option<String>,
    /// Minimum `last_ping_at` (epoch millis).
    pub online_since: Option<i64>,
}

impl QueryFilter {
    /// Enabled remotes only.
    pub fn enabled() -> Self {
        Self {
            enabled_only: true,
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn excluding(mut self, remote_id: impl Into<String>) -> Self {
        self.exclude_ids.insert(remote_id.into());
        self
    }

    pub fn created_by(mut self, user_id: impl Into<String>) -> Self {
        self.creator_id = Some(user_id.into());
        self
    }

    pub fn online_since(mut self, since_ms: i64) -> Self {
        self.online_since = Some(since_ms);
        self
    }

    pub fn matches(&self, rc: &RemoteCluster) -> bool {
        if self.enabled_only && !rc.enabled {
            return false;
        }
        if let Some(topic) = &self.topic {
            if !rc.subscribes_to(topic) {
                return false;
            }
        }
        if self.exclude_ids.contains(&rc.remote_id) {
            return false;
        }
        if let Some(creator) = &self.creator_id {
            if rc.creator_id.as_deref() != Some(creator.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.online_since {
            if rc.last_ping_at < since {
                return false;
            }
        }
        true
    }
}

/// A local user registrations can be attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
}

impl User {
    pub fn new(id: impl Into<String>, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: email.into(),
        }
    }
}
