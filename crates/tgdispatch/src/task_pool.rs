//! Optional placement of update executions on an external task pool.
//!
//! By default a worker runs each update inline. With a [`TaskPool`]
//! configured, the worker submits the execution and moves on to the next
//! update. A pool that cannot take the task hands it back inside
//! [`Rejected`], and the worker runs it inline instead, so every update is
//! executed exactly once whichever path it takes.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::task::TaskTracker;

/// One update execution, ready to be polled to completion.
pub type Task = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("task pool is saturated")]
    Saturated,
    #[error("task pool is closed")]
    Closed,
}

/// A submission the pool refused, with the task handed back.
pub struct Rejected {
    pub task: Task,
    pub reason: SubmitError,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Somewhere to run update executions off the worker.
pub trait TaskPool: Send + Sync + 'static {
    /// Start `task` or give it back. Must not block.
    fn submit(&self, task: Task) -> Result<(), Rejected>;
}

/// A fixed-capacity pool on the current tokio runtime.
///
/// At most `capacity` tasks run at once; submissions beyond that are
/// rejected as [`SubmitError::Saturated`] rather than queued.
pub struct BoundedTaskPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    capacity: usize,
}

impl BoundedTaskPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently running.
    pub fn running(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    /// Reject all further submissions. Running tasks are unaffected.
    pub fn close(&self) {
        self.permits.close();
        self.tracker.close();
    }

    /// Wait for running tasks after [`close`](Self::close).
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

impl TaskPool for BoundedTaskPool {
    fn submit(&self, task: Task) -> Result<(), Rejected> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(Rejected {
                    task,
                    reason: SubmitError::Saturated,
                })
            }
            Err(TryAcquireError::Closed) => {
                return Err(Rejected {
                    task,
                    reason: SubmitError::Closed,
                })
            }
        };
        self.tracker.spawn(async move {
            let _permit = permit;
            task.await;
        });
        Ok(())
    }
}

impl fmt::Debug for BoundedTaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTaskPool")
            .field("capacity", &self.capacity)
            .field("running", &self.running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_submit_runs_task() {
        let pool = BoundedTaskPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        pool.submit(
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        )
        .unwrap();

        pool.close();
        pool.wait().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_saturated_pool_hands_task_back() {
        let pool = BoundedTaskPool::new(1);
        let release = Arc::new(Notify::new());

        let gate = release.clone();
        pool.submit(async move { gate.notified().await }.boxed())
            .unwrap();
        assert_eq!(pool.running(), 1);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let rejected = pool
            .submit(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap_err();
        assert_eq!(rejected.reason, SubmitError::Saturated);

        // The caller still owns the task and can run it itself.
        rejected.task.await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        release.notify_one();
        pool.close();
        tokio::time::timeout(Duration::from_secs(1), pool.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = BoundedTaskPool::new(4);
        pool.close();
        let rejected = pool.submit(async {}.boxed()).unwrap_err();
        assert_eq!(rejected.reason, SubmitError::Closed);
    }
}
