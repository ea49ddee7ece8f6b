//! Bounded worker pool.
//!
//! Every job is spawned up front and waits on a shared semaphore, so at most
//! `workers` run at once. Results come back in job order after all jobs have
//! finished. A failing job never cancels its siblings; cancelling the token
//! stops jobs that have not started and aborts running ones at their next
//! suspension point.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use lexiforge_shared::{LexiforgeError, Result};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// A pool of `workers` concurrent slots (at least one).
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `jobs` and return one result per job, in input order.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, jobs: Vec<F>) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let sem = semaphore.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(LexiforgeError::Cancelled),
                    permit = sem.acquire_owned() => {
                        permit.map_err(|e| LexiforgeError::Task(e.to_string()))?
                    }
                };
                if cancel.is_cancelled() {
                    return Err(LexiforgeError::Cancelled);
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(LexiforgeError::Cancelled),
                    result = job(cancel.clone()) => result,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(LexiforgeError::Task(e.to_string())),
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn results_keep_job_order() {
        let pool = WorkerPool::new(3);
        let jobs: Vec<_> = (0..6u64)
            .map(|i| {
                move |_cancel: CancellationToken| async move {
                    tokio::time::sleep(Duration::from_millis(30 - i * 5)).await;
                    if i == 4 {
                        Err(LexiforgeError::validation("four"))
                    } else {
                        Ok(i)
                    }
                }
            })
            .collect();
        let results = pool.run(&CancellationToken::new(), jobs).await;
        assert_eq!(results.len(), 6);
        for (i, result) in results.iter().enumerate() {
            match result {
                Ok(v) => assert_eq!(*v, i as u64),
                Err(_) => assert_eq!(i, 4),
            }
        }
    }

    #[tokio::test]
    async fn never_exceeds_width() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                move |_cancel: CancellationToken| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();
        let results = pool.run(&CancellationToken::new(), jobs).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_pending_jobs() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<_> = (0..3)
            .map(|_| {
                let started = started.clone();
                move |_cancel: CancellationToken| async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();
        let results = pool.run(&cancel, jobs).await;
        assert!(results.iter().all(|r| matches!(r, Err(LexiforgeError::Cancelled))));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn width_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).workers(), 1);
    }
}
