//! Priority queue of QUEUED tasks.
//!
//! Entries are ordered by `(priority, arrival, seq)`. Comparing the tuple
//! lexicographically is the same as a scalar `priority * K + arrival` key
//! with `K` larger than any arrival span, so a priority class always
//! dominates arrival order, and arrival (not insertion order) decides within
//! a class. `seq` only separates identical arrival stamps.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use mofsim_core::{Priority, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    priority: Priority,
    arrival: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

/// A queued task as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: Priority,
    pub arrival: DateTime<Utc>,
    pub seq: u64,
}

impl From<&SortKey> for QueueEntry {
    fn from(key: &SortKey) -> Self {
        Self {
            task_id: key.task_id,
            priority: key.priority,
            arrival: key.arrival,
            seq: key.seq,
        }
    }
}

/// Per-class queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub oldest_arrival: BTreeMap<Priority, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct QueueInner {
    ordered: BTreeSet<SortKey>,
    index: HashMap<TaskId, SortKey>,
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    inner: Mutex<QueueInner>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a task. Re-enqueueing an id replaces its previous entry.
    pub fn enqueue(&self, task_id: TaskId, priority: Priority, arrival: DateTime<Utc>, seq: u64) {
        let key = SortKey {
            priority,
            arrival,
            seq,
            task_id,
        };
        let mut inner = self.lock();
        if let Some(old) = inner.index.insert(task_id, key) {
            inner.ordered.remove(&old);
        }
        inner.ordered.insert(key);
        debug!(
            task_id = %task_id,
            priority = %priority,
            queue_size = inner.ordered.len(),
            "task enqueued"
        );
    }

    /// The entry with the minimal sort key, without removing it.
    pub fn dequeue_peek(&self) -> Option<QueueEntry> {
        self.lock().ordered.first().map(QueueEntry::from)
    }

    /// The first `n` entries in dequeue order.
    pub fn peek_window(&self, n: usize) -> Vec<QueueEntry> {
        self.lock()
            .ordered
            .iter()
            .take(n)
            .map(QueueEntry::from)
            .collect()
    }

    /// Consume a previously peeked entry. Returns false if it was already
    /// gone (cancelled or committed by someone else).
    pub fn commit_dequeue(&self, task_id: &TaskId) -> bool {
        let mut inner = self.lock();
        match inner.index.remove(task_id) {
            Some(key) => {
                inner.ordered.remove(&key);
                debug!(task_id = %task_id, queue_size = inner.ordered.len(), "task dequeued");
                true
            }
            None => false,
        }
    }

    /// Remove a task (cancellation). Idempotent: absent ids are a no-op.
    pub fn remove(&self, task_id: &TaskId) -> bool {
        let mut inner = self.lock();
        match inner.index.remove(task_id) {
            Some(key) => {
                inner.ordered.remove(&key);
                info!(task_id = %task_id, "task removed from queue");
                true
            }
            None => false,
        }
    }

    /// 0-indexed position in dequeue order.
    pub fn position(&self, task_id: &TaskId) -> Option<usize> {
        let inner = self.lock();
        let key = inner.index.get(task_id)?;
        Some(inner.ordered.range(..*key).count())
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.lock().index.contains_key(task_id)
    }

    /// Move a task to another class, keeping its arrival stamp.
    pub fn reprioritize(&self, task_id: &TaskId, priority: Priority) -> bool {
        let mut inner = self.lock();
        let Some(old) = inner.index.get(task_id).copied() else {
            return false;
        };
        let key = SortKey { priority, ..old };
        inner.ordered.remove(&old);
        inner.ordered.insert(key);
        inner.index.insert(*task_id, key);
        info!(
            task_id = %task_id,
            old_priority = %old.priority,
            new_priority = %priority,
            "task reprioritized"
        );
        true
    }

    pub fn len(&self) -> usize {
        self.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ordered.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        let mut stats = QueueStats {
            total: inner.ordered.len(),
            by_priority: Priority::ALL.iter().map(|p| (*p, 0)).collect(),
            oldest_arrival: BTreeMap::new(),
        };
        for key in &inner.ordered {
            *stats.by_priority.entry(key.priority).or_default() += 1;
            // Ordered iteration: the first key seen per class is its oldest.
            stats.oldest_arrival.entry(key.priority).or_insert(key.arrival);
        }
        stats
    }
}
