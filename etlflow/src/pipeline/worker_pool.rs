//! Fixed-size pool of blocking workers for batch jobs.

use crate::cancellation::CancellationToken;
use crate::errors::EtlError;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// A submitted job.
pub type JobHandle<T> = JoinHandle<Result<T, EtlError>>;

/// Runs owned jobs on the blocking thread pool, at most `size` at a time.
///
/// [`WorkerPool::submit`] waits for a free slot, which bounds the number of
/// jobs in flight. Closing the pool wakes waiting submitters with
/// [`EtlError::Cancelled`]; jobs already running are abandoned, not awaited.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool with `size` workers (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Creates a pool that closes when `token` is cancelled.
    #[must_use]
    pub fn with_token(size: usize, token: &CancellationToken) -> Self {
        let pool = Self::new(size);
        let slots = Arc::clone(&pool.slots);
        token.on_cancel(move || slots.close());
        pool
    }

    /// Returns the number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of idle workers.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits for a free worker and starts `job` on it.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Cancelled`] when the pool was closed.
    pub async fn submit<T, F>(&self, job: F) -> Result<JobHandle<T>, EtlError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, EtlError> + Send + 'static,
    {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| EtlError::Cancelled("worker pool closed".to_string()))?;
        Ok(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        }))
    }

    /// Stops accepting jobs.
    pub fn close(&self) {
        self.slots.close();
    }
}

/// Awaits a job, turning a panic into [`EtlError::Internal`].
///
/// # Errors
///
/// Returns the job's own error, or an internal error when it panicked.
pub async fn join_job<T>(handle: JobHandle<T>) -> Result<T, EtlError> {
    match handle.await {
        Ok(result) => result,
        Err(join_error) if join_error.is_cancelled() => {
            Err(EtlError::Cancelled("worker job aborted".to_string()))
        }
        Err(join_error) => Err(EtlError::Internal(format!("Worker job panicked: {join_error}"))),
    }
}
