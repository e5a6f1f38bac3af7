//! `WorkerPool` — a bounded task executor for handler invocation (spec.md
//! §4.3).
//!
//! The reactor must never block (spec.md §5), so every unit of work that
//! might take a while — a decoded message handler, a ping reply write —
//! is handed to this pool instead of run inline. The bound is a
//! [`tokio::sync::Semaphore`]: acquiring a permit *is* "having a free
//! worker", and releasing it on task completion *is* "idle worker
//! expiry" — there's no separate thread-pool to spin down because the
//! tokio runtime already multiplexes these tasks over a shared set of OS
//! threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::RippleError;

/// Bounded, optionally non-blocking task executor (spec.md §4.3).
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    nonblocking: bool,
    idle_expiry: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(capacity: usize, nonblocking: bool, idle_expiry: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            nonblocking,
            idle_expiry,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn idle_expiry(&self) -> Duration {
        self.idle_expiry
    }

    /// Submit a task. In non-blocking mode, fails immediately with
    /// [`RippleError::PoolExhausted`] when no worker is free; in blocking
    /// mode, waits for one. The task closure captures everything it needs
    /// by value — nothing from the caller's task-local state survives
    /// across the `tokio::spawn` boundary, matching spec.md's "never
    /// capture goroutine-local state" invariant by construction (Rust's
    /// `'static` bound on spawned futures enforces it).
    pub fn submit<F>(&self, task: F) -> Result<(), RippleError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.nonblocking {
            self.try_submit(task)
        } else {
            self.submit_blocking(task);
            Ok(())
        }
    }

    /// Always rejects instead of waiting when no worker is free.
    pub fn try_submit<F>(&self, task: F) -> Result<(), RippleError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return Err(RippleError::PoolExhausted),
        };
        self.spawn_with_permit(permit, task);
        Ok(())
    }

    /// Always waits for a free worker before running the task.
    pub fn submit_blocking<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let permit = semaphore
                .acquire_owned()
                .await
                .expect("worker pool semaphore closed");
            task.await;
            drop(permit);
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    fn spawn_with_permit<F>(&self, permit: tokio::sync::OwnedSemaphorePermit, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            task.await;
            drop(permit);
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn nonblocking_submit_rejects_when_exhausted() {
        let pool = WorkerPool::new(1, true, StdDuration::from_secs(10));
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate2 = Arc::clone(&gate);
        pool.try_submit(async move {
            gate2.notified().await;
        })
        .unwrap();

        // Give the spawned task a chance to acquire its permit.
        tokio::task::yield_now().await;

        let second = pool.try_submit(async {});
        assert!(matches!(second, Err(RippleError::PoolExhausted)));

        gate.notify_one();
    }

    #[tokio::test]
    async fn blocking_submit_waits_for_capacity() {
        let pool = Arc::new(WorkerPool::new(1, false, StdDuration::from_secs(10)));
        let done = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(tokio::sync::Notify::new());

        let gate2 = Arc::clone(&gate);
        pool.try_submit(async move {
            gate2.notified().await;
        })
        .unwrap();
        tokio::task::yield_now().await;

        let done2 = Arc::clone(&done);
        let pool2 = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            pool2.submit_blocking(async move {
                done2.store(true, Ordering::SeqCst);
            });
        });

        tokio::task::yield_now().await;
        assert!(!done.load(Ordering::SeqCst));

        gate.notify_one();
        handle.await.unwrap();
        // Give the now-unblocked task a moment to run on the runtime.
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(done.load(Ordering::SeqCst));
    }
}
