//! Bounded worker pool.
//!
//! Every blocking job (IMAP sessions, preference file I/O) and every outbound
//! HTTP call (model backend, webhook) takes a permit from the same
//! semaphore, so at most `size` of them are in flight at once. Blocking jobs
//! run on tokio's blocking threads; the coordination task only awaits.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::WorkerError;

/// Default number of concurrent jobs.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Fixed-size pool gating blocking and outbound work.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running job.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a blocking closure on a worker thread once a permit is free.
    pub async fn run_blocking<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| WorkerError::Panicked(e.to_string()))
    }

    /// Await an async job while holding a permit.
    pub async fn run<F>(&self, job: F) -> Result<F::Output, WorkerError>
    where
        F: Future,
    {
        let _permit = self.permits.acquire().await.map_err(|_| WorkerError::Closed)?;
        Ok(job.await)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}
