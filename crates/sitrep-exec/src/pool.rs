//! Bounded worker pool
//!
//! A fixed number of workers drain a shared item queue concurrently on the
//! calling task. Item failures are collected, never fatal; cancellation stops
//! each worker before it takes its next item.

use std::fmt::Display;
use std::future::Future;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PoolError;

/// Fixed-size pool of async workers
#[derive(Debug, Clone)]
pub struct WorkerPool {
    size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create a pool with `size` workers (at least one)
    #[must_use]
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        Self {
            size: size.max(1),
            cancel,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Feed every item to `task`, `size` at a time
    ///
    /// Returns the number of processed items.
    ///
    /// # Errors
    /// Returns a [`PoolError`] holding every item failure once all workers
    /// have drained, or when the pool was cancelled before the queue emptied.
    pub async fn run<I, F, Fut, E>(&self, items: I, task: F) -> Result<usize, PoolError>
    where
        I: IntoIterator,
        I::IntoIter: Send,
        I::Item: Send,
        F: Fn(I::Item) -> Fut + Sync,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display + Send,
    {
        let queue = Mutex::new(items.into_iter());
        let failures = Mutex::new(Vec::new());
        let processed = Mutex::new(0usize);

        let workers = (0..self.size).map(|worker| {
            let queue = &queue;
            let failures = &failures;
            let processed = &processed;
            let task = &task;
            async move {
                loop {
                    if self.cancel.is_cancelled() {
                        debug!(worker, "worker observed cancellation");
                        break;
                    }
                    let Some(item) = queue.lock().await.next() else {
                        break;
                    };
                    *processed.lock().await += 1;
                    if let Err(e) = task(item).await {
                        failures.lock().await.push(e.to_string());
                    }
                }
            }
        });
        join_all(workers).await;

        let failures = failures.into_inner();
        let processed = processed.into_inner();
        let cancelled = self.cancel.is_cancelled() && queue.into_inner().next().is_some();

        if failures.is_empty() && !cancelled {
            return Ok(processed);
        }
        if !failures.is_empty() {
            warn!(failed = failures.len(), processed, "worker pool finished with failures");
        }
        Err(PoolError {
            failures,
            processed,
            cancelled,
        })
    }
}
