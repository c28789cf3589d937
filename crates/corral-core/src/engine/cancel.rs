//! Cooperative cancellation for traversals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A cloneable cancellation token.
///
/// `cancel` is sticky: once set, all current and future `cancelled` waits
/// complete immediately. In-flight store calls race against the token; the
/// traversal returns its partial graph with a cancelled status.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            // Register the waiter before checking the flag to avoid losing
            // a wakeup that lands between check and await.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
