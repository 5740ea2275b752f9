//! Bounded fan-out of per-item work
//!
//! This module handles:
//! - Capping how many tasks run at once via a semaphore
//! - FIFO admission of waiting tasks
//! - Settle-all collection of results, where a failure never cancels siblings

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Limits the number of concurrently running tasks
///
/// Cloning shares the same limit. Waiting tasks are admitted in the order
/// they asked for a permit (tokio's semaphore is fair).
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    /// Permits for running tasks
    semaphore: Arc<Semaphore>,

    /// Tasks currently holding a permit
    active: Arc<AtomicUsize>,

    limit: usize,
}

/// Decrements the active count when a task finishes, panics included
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimit {
    /// Creates a limiter; a limit of zero is raised to one
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Runs a task once a slot is free
    ///
    /// The slot is released when the task completes, whether it succeeded,
    /// failed or panicked.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is never closed, so acquisition only fails if that
        // changes; the task then runs unthrottled rather than being dropped.
        let _permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();

        self.active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(Arc::clone(&self.active));

        task.await
    }

    /// Tasks currently running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Maximum concurrent tasks
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Runs every task under the limit and returns all results in submission order
///
/// # Arguments
///
/// * `limit` - The shared concurrency limit
/// * `tasks` - Futures to run; each is isolated from the others' failures
///
/// # Returns
///
/// One result per task, in the order the tasks were supplied
pub async fn settle_all<I, F, T, E>(limit: &ConcurrencyLimit, tasks: I) -> Vec<Result<T, E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    join_all(tasks.into_iter().map(|task| limit.run(task))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_zero_limit_raised_to_one() {
        assert_eq!(ConcurrencyLimit::new(0).limit(), 1);
        assert_eq!(ConcurrencyLimit::new(4).limit(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit_and_settles_all() {
        let limit = ConcurrencyLimit::new(3);
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..10).map(|i| {
            let limit = limit.clone();
            let peak = Arc::clone(&peak);
            async move {
                peak.fetch_max(limit.active(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 + i as u64)).await;
                if i == 3 {
                    Err(format!("task {} failed", i))
                } else {
                    Ok(i)
                }
            }
        });

        let results = settle_all(&limit, tasks).await;

        assert_eq!(results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 9);
        assert!(matches!(&results[3], Err(msg) if msg == "task 3 failed"));
        assert_eq!(results[9], Ok(9));
        assert_eq!(limit.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_admission() {
        let limit = ConcurrencyLimit::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let tasks = (0..5).map(|i| {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, ()>(i)
            }
        });

        settle_all(&limit, tasks).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_slot() {
        let limit = ConcurrencyLimit::new(1);

        let shared = limit.clone();
        let handle = tokio::spawn(async move {
            shared
                .run(async {
                    panic!("task blew up");
                })
                .await
        });
        assert!(handle.await.is_err());

        assert_eq!(limit.active(), 0);
        let value = limit.run(async { 7 }).await;
        assert_eq!(value, 7);
    }
}
