//! Per-remote task queue and the dead-letter log.
//!
//! A [`RemoteQueue`] keeps one FIFO per topic. Only the head of each topic
//! is ever eligible to send, so a task in backoff holds back the tasks
//! behind it in the same topic while other topics keep moving.

use super::types::{DeadLetter, SyncTask};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tokio::time::Instant;

/// Tasks for one remote, FIFO within each topic.
#[derive(Debug, Default)]
pub struct RemoteQueue {
    topics: BTreeMap<String, VecDeque<SyncTask>>,
    len: usize,
}

impl RemoteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append to the tail of the task's topic.
    pub fn push(&mut self, task: SyncTask) {
        self.topics.entry(task.topic.clone()).or_default().push_back(task);
        self.len += 1;
    }

    /// Return a task to the head of its topic.
    pub fn push_front(&mut self, task: SyncTask) {
        self.topics.entry(task.topic.clone()).or_default().push_front(task);
        self.len += 1;
    }

    /// Topics whose head is due at `now`, in topic order.
    pub fn due_topics(&self, now: Instant) -> Vec<String> {
        self.topics
            .iter()
            .filter(|(_, q)| q.front().is_some_and(|t| t.is_due(now)))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Remove and return the head of `topic`.
    pub fn pop_head(&mut self, topic: &str) -> Option<SyncTask> {
        let queue = self.topics.get_mut(topic)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            self.topics.remove(topic);
        }
        if task.is_some() {
            self.len -= 1;
        }
        task
    }

    pub fn head(&self, topic: &str) -> Option<&SyncTask> {
        self.topics.get(topic).and_then(VecDeque::front)
    }

    /// Earliest `next_attempt_at` among topic heads.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.topics
            .values()
            .filter_map(|q| q.front().map(|t| t.next_attempt_at))
            .min()
    }

    /// Move every task of `other` behind this queue's tasks.
    pub fn append(&mut self, other: RemoteQueue) {
        for (topic, tasks) in other.topics {
            self.len += tasks.len();
            self.topics.entry(topic).or_default().extend(tasks);
        }
    }

    /// Drop everything. Returns how many tasks were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.len;
        self.topics.clear();
        self.len = 0;
        removed
    }

    /// Drop every topic `keep` rejects. Returns how many tasks were removed.
    pub fn retain_topics(&mut self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let mut removed = 0;
        self.topics.retain(|topic, tasks| {
            if keep(topic.as_str()) {
                true
            } else {
                removed += tasks.len();
                false
            }
        });
        self.len -= removed;
        removed
    }

    /// All tasks, topic by topic, FIFO within a topic.
    pub fn iter(&self) -> impl Iterator<Item = &SyncTask> {
        self.topics.values().flat_map(|q| q.iter())
    }
}

/// Bounded log of tasks that will not be delivered.
///
/// Oldest entries are evicted once `capacity` is reached.
#[derive(Debug)]
pub struct DeadLetterLog {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a dead letter. Returns the evicted entry, if any.
    pub fn push(&self, letter: DeadLetter) -> Option<DeadLetter> {
        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(letter);
        evicted
    }

    pub fn all(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn for_remote(&self, remote_id: &str) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .iter()
            .filter(|l| l.task.remote_id == remote_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
