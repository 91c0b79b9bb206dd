//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent - only the first cancellation reason is kept.
#[derive(Default)]
pub struct CancellationToken {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: Arc<RwLock<Option<String>>>,
    /// Callbacks to invoke on cancellation.
    callbacks: RwLock<Vec<CancelCallback>>,
    /// Child tokens; dropped children are pruned on registration.
    children: RwLock<Vec<Weak<CancellationToken>>>,
    /// Wakes tasks waiting in [`CancellationToken::cancelled`].
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled whenever `self` is.
    ///
    /// Cancelling the child does not affect the parent. The parent holds the
    /// child weakly.
    #[must_use]
    pub fn child(&self) -> Arc<Self> {
        let child = Arc::new(Self::new());
        {
            let mut children = self.children.write();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        if self.is_cancelled() {
            child.cancel(self.parent_reason());
        }
        child
    }

    fn parent_reason(&self) -> String {
        self.reason().unwrap_or_else(|| "parent cancelled".to_string())
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.reason.write() = Some(reason.into());
            self.notify.notify_waiters();

            let callbacks = self.callbacks.read();
            for callback in callbacks.iter() {
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback();
                })) {
                    warn!("Cancellation callback panicked: {:?}", e);
                }
            }
            drop(callbacks);

            let children: Vec<_> = std::mem::take(&mut *self.children.write());
            let reason = self.parent_reason();
            for child in children.iter().filter_map(Weak::upgrade) {
                child.cancel(reason.clone());
            }
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback();
            })) {
                warn!("Cancellation callback panicked: {:?}", e);
            }
        } else {
            self.callbacks.write().push(Box::new(callback));
        }
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    #[cfg(test)]
    fn child_count(&self) -> usize {
        self.children.read().len()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[test]
    fn test_on_cancel_before_and_after_cancellation() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let before = counter.clone();
        token.on_cancel(move || {
            before.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        token.cancel("test");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let after = counter.clone();
        token.on_cancel(move || {
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel("child only");
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel("interrupted");
        assert!(other.is_cancelled());
        assert_eq!(other.reason(), Some("interrupted".to_string()));

        let late = parent.child();
        assert_eq!(late.reason(), Some("interrupted".to_string()));
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let root = CancellationToken::new();
        for _ in 0..1000 {
            let _ = root.child();
        }
        assert!(root.child_count() <= 1);

        let kept = root.child();
        assert_eq!(root.child_count(), 1);
        root.cancel("done");
        assert!(kept.is_cancelled());
    }
}
