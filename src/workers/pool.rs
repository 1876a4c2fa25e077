use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs at most `max_workers` transfer tasks at once, one active task per
/// path. Unlike the donor's `TaskQueue`, there is no command channel or
/// inventory of its own: the coordinator already serializes dispatch
/// through its single event loop, so the pool's only job is bounding
/// concurrency and giving the coordinator a way to cancel a path's
/// in-flight transfer.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tokens: DashMap<String, CancellationToken>,
    handles: DashMap<String, JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            tokens: DashMap::new(),
            handles: DashMap::new(),
        })
    }

    /// Submits work for `path`. `make_task` is called with a fresh
    /// cancellation token once a worker slot is free, and its future runs
    /// to completion (or cancellation) on that slot. Replaces any prior
    /// task tracked for the same path without waiting for it to finish;
    /// callers are expected to have already cancelled it (sec 4.9's
    /// `CancelAndRequeue` decision does this before resubmitting).
    pub fn submit<F, Fut>(self: &Arc<Self>, path: impl Into<String>, make_task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let path = path.into();
        let token = CancellationToken::new();
        self.tokens.insert(path.clone(), token.clone());

        let pool = Arc::clone(self);
        let semaphore = Arc::clone(&self.semaphore);
        let task_path = path.clone();

        let handle = tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            make_task(token).await;

            drop(permit);
            pool.tokens.remove(&task_path);
            pool.handles.remove(&task_path);
        });

        self.handles.insert(path, handle);
    }

    /// Requests cancellation of the task running for `path`, if any.
    /// Returns `false` if no task is tracked for that path.
    pub fn cancel(&self, path: &str) -> bool {
        match self.tokens.get(path) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, path: &str) -> bool {
        self.handles.contains_key(path)
    }

    pub fn active_count(&self) -> usize {
        self.handles.len()
    }

    /// Cancels every running task and waits for them all to finish.
    pub async fn shutdown(&self) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }

        let paths: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            if let Some((_, handle)) = self.handles.remove(&path) {
                if let Err(err) = handle.await {
                    debug!(target: "workers::pool", %path, %err, "worker task panicked during shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn submitted_task_runs_and_clears_tracking() {
        let pool = WorkerPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        pool.submit("a.txt", move |_token| async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!pool.is_active("a.txt"));
    }

    #[tokio::test]
    async fn cancel_signals_the_running_task() {
        let pool = WorkerPool::new(2);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let cancelled_clone = Arc::clone(&cancelled);

        pool.submit("a.txt", move |token| async move {
            token.cancelled().await;
            cancelled_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.cancel("a.txt"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_on_unknown_path_returns_false() {
        let pool = WorkerPool::new(1);
        assert!(!pool.cancel("missing.txt"));
    }

    #[tokio::test]
    async fn respects_max_worker_bound() {
        let pool = WorkerPool::new(1);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            pool.submit(format!("file-{i}.txt"), move |_token| async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_and_waits_for_tasks() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        let done_clone = Arc::clone(&done);

        pool.submit("a.txt", move |token| async move {
            token.cancelled().await;
            done_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
