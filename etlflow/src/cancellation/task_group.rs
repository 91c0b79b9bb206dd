//! Structured task group for managing related async tasks.

use super::CancellationToken;
use crate::errors::EtlError;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

type NamedHandle = (String, JoinHandle<Result<(), EtlError>>);

/// A group of related tasks with structured cancellation.
///
/// If any task errors, the group token is cancelled and the remaining tasks
/// are aborted. `wait` returns only after every task has finished.
pub struct StructuredTaskGroup {
    /// The cancellation token for this group.
    cancel_token: Arc<CancellationToken>,
    /// Handles to spawned tasks.
    handles: Mutex<Vec<NamedHandle>>,
}

impl StructuredTaskGroup {
    /// Creates a new task group with its own token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(Arc::new(CancellationToken::new()))
    }

    /// Creates a task group sharing `token`.
    #[must_use]
    pub fn with_token(token: Arc<CancellationToken>) -> Self {
        Self {
            cancel_token: token,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Spawns a task in the group.
    pub fn spawn<F, Fut>(&self, name: &str, task: F)
    where
        F: FnOnce(Arc<CancellationToken>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), EtlError>> + Send + 'static,
    {
        let token = self.cancel_token.clone();
        let handle = tokio::spawn(async move { task(token).await });
        self.handles.lock().push((name.to_string(), handle));
    }

    /// Cancels all tasks in the group.
    pub fn cancel_all(&self, reason: &str) {
        self.cancel_token.cancel(reason);
    }

    /// Waits for all tasks to complete.
    ///
    /// The first failure cancels the token and aborts the other tasks.
    ///
    /// # Errors
    ///
    /// Returns the first error; a panicking task becomes
    /// [`EtlError::Internal`].
    pub async fn wait(&self) -> Result<(), EtlError> {
        let handles = std::mem::take(&mut *self.handles.lock());
        let aborts: Vec<AbortHandle> = handles.iter().map(|(_, h)| h.abort_handle()).collect();

        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .map(|(name, handle)| async move { (name, handle.await) })
            .collect();

        let mut first_error: Option<EtlError> = None;
        while let Some((name, result)) = pending.next().await {
            let error = match result {
                Ok(Ok(())) => {
                    debug!(task = %name, "Task finished");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join_error) if join_error.is_cancelled() => continue,
                Err(join_error) => EtlError::Internal(format!("Task '{name}' panicked: {join_error}")),
            };

            if first_error.is_none() {
                warn!(task = %name, error = %error, "Task failed; cancelling group");
                self.cancel_token.cancel(format!("task '{name}' failed: {error}"));
                for abort in &aborts {
                    abort.abort();
                }
                first_error = Some(error);
            } else {
                debug!(task = %name, error = %error, "Further task failure after cancellation");
            }
        }

        match first_error {
            Some(error) => Err(error),
            None if self.cancel_token.is_cancelled() => Err(EtlError::Cancelled(
                self.cancel_token.reason().unwrap_or_else(|| "cancelled".to_string()),
            )),
            None => Ok(()),
        }
    }

    /// Returns the number of tasks not yet awaited.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }
}

impl Default for StructuredTaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StructuredTaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredTaskGroup")
            .field("task_count", &self.task_count())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_group_success() {
        let group = StructuredTaskGroup::new();

        group.spawn("task1", |_token| async { Ok(()) });
        group.spawn("task2", |_token| async { Ok(()) });

        assert!(group.wait().await.is_ok());
        assert_eq!(group.task_count(), 0);
    }

    #[tokio::test]
    async fn test_first_error_cancels_and_aborts_siblings() {
        let group = StructuredTaskGroup::new();

        group.spawn("forever", |_token| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        group.spawn("failure", |_token| async {
            Err(EtlError::Extract("source gone".to_string()))
        });

        let result = tokio::time::timeout(Duration::from_secs(5), group.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(EtlError::Extract(_))));
        assert!(group.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let group = StructuredTaskGroup::new();
        group.spawn("boom", |_token| async {
            let exploded = true;
            assert!(!exploded, "kaboom");
            Ok(())
        });

        match group.wait().await {
            Err(EtlError::Internal(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_task_respects_cancellation() {
        let group = StructuredTaskGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        group.spawn("long_task", move |token| {
            let counter = counter_clone;
            async move {
                for _ in 0..10 {
                    if token.is_cancelled() {
                        return Ok(());
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        group.cancel_all("Manual cancel");

        let result = group.wait().await;
        assert!(matches!(result, Err(EtlError::Cancelled(_))));
        assert!(counter.load(Ordering::SeqCst) < 10);
    }
}
