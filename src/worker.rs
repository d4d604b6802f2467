//! The worker loop: lease a task, execute it, delete it.

use crate::error::Result;
use crate::queue::{Lease, TaskQueue};
use crate::tasks::TaskContext;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls a queue and executes tasks one at a time. Task failures are
/// fail-fast: the error propagates and the task stays leased, to be retried
/// by someone else once the lease lapses.
pub struct Worker {
    queue: Arc<TaskQueue>,
    ctx: TaskContext,
    tag: Option<String>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: Arc<TaskQueue>, ctx: TaskContext) -> Self {
        Self {
            queue,
            ctx,
            tag: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Restricts this worker to one kind of task.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs one lease/execute/delete cycle. Returns whether a task was found.
    pub async fn step(&self) -> Result<bool> {
        match self.queue.lease(self.tag.as_deref()) {
            Lease::Found(leased) => {
                if let Err(e) = leased.task.execute(&self.ctx).await {
                    tracing::error!(id = %leased.id, error = %e, "task failed");
                    return Err(e);
                }
                self.queue.delete(leased.id)?;
                Ok(true)
            }
            Lease::Empty => Ok(false),
        }
    }

    /// Drains the queue, returning how many tasks ran.
    pub async fn run_until_empty(&self) -> Result<usize> {
        let mut count = 0;
        while self.step().await? {
            count += 1;
        }
        Ok(count)
    }

    /// Runs forever, sleeping between polls while the queue is empty.
    pub async fn run(&self) -> Result<()> {
        loop {
            if !self.step().await? {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::{Bbox, Vec3};
    use crate::codec::Encoding;
    use crate::error::VoxError;
    use crate::io::{BlobStore, MemoryStore};
    use crate::layout::Scale;
    use crate::metadata::VolumeInfo;
    use crate::store::VolumeStore;
    use crate::tasks::{LayerRegistry, Task};
    use crate::types::{DataType, LayerType};
    use ndarray::Array4;

    async fn seeded_layer(registry: &LayerRegistry) -> VolumeStore {
        let store: std::sync::Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        registry.insert("mem://layer", Arc::clone(&store));
        let info = VolumeInfo::new(
            DataType::U8,
            1,
            LayerType::Image,
            Scale {
                key: "1_1_1".to_string(),
                resolution: [1, 1, 1],
                voxel_offset: [0, 0, 0],
                chunk_sizes: vec![[32, 32, 32]],
                size: [64, 64, 64],
                encoding: Encoding::Raw,
            },
        );
        let volume = VolumeStore::create(store, info).await.unwrap();
        let data = Array4::from_elem((64, 64, 64, 1), 9u8);
        let full = Bbox::new(Vec3::zero(), Vec3::splat(64));
        volume.write(0, &full, data.view()).await.unwrap();
        volume.add_scale([2, 2, 2]).unwrap();
        volume.commit_info().await.unwrap();
        volume
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let registry = Arc::new(LayerRegistry::new());
        let volume = seeded_layer(&registry).await;

        let queue = Arc::new(TaskQueue::new());
        for chunk in volume.scale(1).unwrap().chunk_grid() {
            queue.insert(Task::DownsampleTask {
                chunk_path: volume.scale(1).unwrap().chunk_key(&chunk),
                layer_path: "mem://layer".to_string(),
            });
        }
        assert_eq!(queue.len(), 1);

        let worker = Worker::new(Arc::clone(&queue), TaskContext::new(registry));
        let ran = worker.run_until_empty().await.unwrap();
        assert_eq!(ran, 1);
        assert!(queue.is_empty());

        let out = volume
            .read::<u8>(1, &Bbox::new(Vec3::zero(), Vec3::splat(32)))
            .await
            .unwrap();
        assert!(out.iter().all(|&v| v == 9));
    }

    #[tokio::test]
    async fn test_failed_task_stays_leased() {
        let registry = Arc::new(LayerRegistry::new());
        let queue = Arc::new(TaskQueue::new());
        queue.insert(Task::DownsampleTask {
            chunk_path: "2_2_2/0-32_0-32_0-32".to_string(),
            // unresolvable layer path
            layer_path: "bogus://nowhere".to_string(),
        });

        let worker = Worker::new(Arc::clone(&queue), TaskContext::new(registry));
        let err = worker.run_until_empty().await.unwrap_err();
        assert!(matches!(err, VoxError::InvalidUrl(_)));
        // not deleted; it will be retried after the lease lapses
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_tagged_worker_skips_other_tasks() {
        let registry = Arc::new(LayerRegistry::new());
        let queue = Arc::new(TaskQueue::new());
        queue.insert(Task::DownsampleTask {
            chunk_path: "2_2_2/0-32_0-32_0-32".to_string(),
            layer_path: "mem://layer".to_string(),
        });

        let worker = Worker::new(Arc::clone(&queue), TaskContext::new(registry))
            .with_tag("IngestTask");
        let ran = worker.run_until_empty().await.unwrap();
        assert_eq!(ran, 0);
        assert_eq!(queue.len(), 1);
    }
}
