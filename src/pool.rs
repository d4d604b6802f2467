//! Bounded fan-out worker pool for storage and pipeline jobs. Submission
//! applies backpressure through a bounded channel; a cancellation signal lets
//! in-flight jobs finish while pending ones are abandoned.

use crate::error::{Result, VoxError};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// How often idle workers re-check the cancellation signal
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fixed set of workers draining a shared bounded job channel.
///
/// The first job error is retained and returned from [`FanoutPool::wait`];
/// later jobs still run, matching a storage fan-out where one failed chunk
/// should not strand its siblings mid-flight.
pub struct FanoutPool {
    tx: mpsc::Sender<Job>,
    cancel: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    first_err: Arc<Mutex<Option<VoxError>>>,
}

impl FanoutPool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (cancel, _) = watch::channel(false);
        let first_err = Arc::new(Mutex::new(None));

        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                let cancel_rx = cancel.subscribe();
                let first_err = Arc::clone(&first_err);
                tokio::spawn(async move {
                    loop {
                        if *cancel_rx.borrow() {
                            break;
                        }
                        let job = {
                            let mut guard = rx.lock().await;
                            tokio::time::timeout(POLL_INTERVAL, guard.recv()).await
                        };
                        match job {
                            Ok(Some(job)) => {
                                if let Err(e) = job.await {
                                    let mut slot = first_err.lock();
                                    if slot.is_none() {
                                        *slot = Some(e);
                                    }
                                }
                            }
                            // channel closed and drained
                            Ok(None) => break,
                            // idle tick, re-check cancellation
                            Err(_) => {}
                        }
                    }
                })
            })
            .collect();

        Self {
            tx,
            cancel,
            workers: handles,
            first_err,
        }
    }

    /// Submits a job, waiting for channel capacity.
    pub async fn put<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tx
            .send(Box::pin(job))
            .await
            .map_err(|_| VoxError::Task("worker pool is shut down".into()))
    }

    /// Signals workers to stop picking up new jobs. Jobs already running
    /// complete normally.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Closes the channel, drains remaining jobs and returns the first job
    /// error, if any. Every worker is joined even when one of them panicked.
    pub async fn wait(self) -> Result<()> {
        let Self {
            tx,
            cancel,
            workers,
            first_err,
        } = self;
        drop(tx);
        let mut panicked = None;
        for handle in workers {
            if let Err(e) = handle.await {
                panicked
                    .get_or_insert_with(|| VoxError::Task(format!("pool worker panicked: {}", e)));
            }
        }
        drop(cancel);
        if let Some(e) = panicked {
            return Err(e);
        }
        let err = first_err.lock().take();
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_jobs_run() {
        let pool = FanoutPool::new(4, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.put(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.wait().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_error_surfaces() {
        let pool = FanoutPool::new(2, 4);
        pool.put(async { Ok(()) }).await.unwrap();
        pool.put(async { Err(VoxError::Task("chunk upload failed".into())) })
            .await
            .unwrap();
        pool.put(async { Ok(()) }).await.unwrap();
        let err = pool.wait().await.unwrap_err();
        assert!(matches!(err, VoxError::Task(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicked_worker_does_not_strand_siblings() {
        let pool = FanoutPool::new(2, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        pool.put(async { panic!("job blew up") }).await.unwrap();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.put(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        // the surviving worker drains every remaining job before wait returns
        let err = pool.wait().await.unwrap_err();
        assert!(matches!(err, VoxError::Task(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_abandons_pending_jobs() {
        let pool = FanoutPool::new(1, 16);
        pool.cancel();
        // give the worker time to observe the signal and exit
        tokio::time::sleep(POLL_INTERVAL * 4).await;

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.put(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.wait().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
