//! In-memory task queue with time-limited leases.
//!
//! The protocol: a worker leases the next available task, performs it, then
//! deletes it before the lease expires. A worker that outlives its lease must
//! still delete the task; since tasks are idempotent, the second executor
//! racing it is harmless.

use crate::error::Result;
use crate::tasks::Task;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default lease duration, matching the task sizes the pipeline produces
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

/// A task handed to a worker, with the id needed to delete it
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub id: Uuid,
    pub task: Task,
}

/// Outcome of a lease attempt. Emptiness is an expected state, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Lease {
    Found(LeasedTask),
    Empty,
}

struct Entry {
    id: Uuid,
    tag: &'static str,
    task: Task,
    leased_until: Option<Instant>,
}

impl Entry {
    fn available(&self, now: Instant) -> bool {
        match self.leased_until {
            Some(until) => until <= now,
            None => true,
        }
    }
}

/// FIFO queue of pipeline tasks with per-task lease expiry.
pub struct TaskQueue {
    entries: Mutex<Vec<Entry>>,
    ttl: Duration,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_LEASE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            ttl,
        }
    }

    /// Enqueues a task, returning its id.
    pub fn insert(&self, task: Task) -> Uuid {
        let id = Uuid::new_v4();
        let tag = task.tag();
        self.entries.lock().push(Entry {
            id,
            tag,
            task,
            leased_until: None,
        });
        tracing::debug!(%id, tag, "task inserted");
        id
    }

    /// Leases the oldest available task, optionally restricted to one tag.
    /// A task whose previous lease has expired becomes available again.
    pub fn lease(&self, tag: Option<&str>) -> Lease {
        self.lease_for(tag, self.ttl)
    }

    pub fn lease_for(&self, tag: Option<&str>, ttl: Duration) -> Lease {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let candidate = entries
            .iter_mut()
            .find(|e| e.available(now) && tag.map_or(true, |t| t == e.tag));
        match candidate {
            Some(entry) => {
                entry.leased_until = Some(now + ttl);
                tracing::debug!(id = %entry.id, tag = entry.tag, "task leased");
                Lease::Found(LeasedTask {
                    id: entry.id,
                    task: entry.task.clone(),
                })
            }
            None => Lease::Empty,
        }
    }

    /// Removes a completed task. Unknown ids are ignored: the task may have
    /// been deleted already by a worker that lost its lease.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            entries.remove(pos);
            tracing::debug!(%id, "task deleted");
        }
        Ok(())
    }

    /// Tasks still enqueued, leased or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_task(n: usize) -> Task {
        Task::IngestTask {
            chunk_path: format!("build/{}-64_0-64_0-64", n),
            chunk_encoding: crate::codec::Encoding::Raw,
            layer_path: "mem://layer".to_string(),
        }
    }

    fn downsample_task() -> Task {
        Task::DownsampleTask {
            chunk_path: "2_2_2/0-32_0-32_0-32".to_string(),
            layer_path: "mem://layer".to_string(),
        }
    }

    #[test]
    fn test_lease_in_insertion_order() {
        let queue = TaskQueue::new();
        let first = queue.insert(ingest_task(0));
        queue.insert(ingest_task(1));

        let Lease::Found(leased) = queue.lease(None) else {
            panic!("expected a task");
        };
        assert_eq!(leased.id, first);
    }

    #[test]
    fn test_leased_task_is_unavailable() {
        let queue = TaskQueue::new();
        queue.insert(ingest_task(0));
        assert!(matches!(queue.lease(None), Lease::Found(_)));
        assert_eq!(queue.lease(None), Lease::Empty);
        // still in the queue until deleted
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_expired_lease_is_reissued() {
        let queue = TaskQueue::new();
        let id = queue.insert(ingest_task(0));

        let Lease::Found(first) = queue.lease_for(None, Duration::ZERO) else {
            panic!("expected a task");
        };
        // the zero-length lease has already expired
        let Lease::Found(second) = queue.lease(None) else {
            panic!("expected the task to be re-leased");
        };
        assert_eq!(first.id, id);
        assert_eq!(second.id, id);
    }

    #[test]
    fn test_tag_filter() {
        let queue = TaskQueue::new();
        queue.insert(ingest_task(0));
        queue.insert(downsample_task());

        assert_eq!(queue.lease(Some("WatershedTask")), Lease::Empty);
        let Lease::Found(leased) = queue.lease(Some("DownsampleTask")) else {
            panic!("expected a downsample task");
        };
        assert_eq!(leased.task.tag(), "DownsampleTask");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let queue = TaskQueue::new();
        let id = queue.insert(ingest_task(0));
        queue.delete(id).unwrap();
        queue.delete(id).unwrap();
        queue.delete(Uuid::new_v4()).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_queue() {
        let queue = TaskQueue::new();
        assert_eq!(queue.lease(None), Lease::Empty);
    }
}
