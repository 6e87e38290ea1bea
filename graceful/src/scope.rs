//! Cancellable lifecycle scopes.
//!
//! A [`Scope`] is a cheap, cloneable handle shared by everything that must
//! stop together. Cancelling it records a [`ShutdownCause`]; only the first
//! cause is kept, later calls are ignored.

use crate::errors::ShutdownCause;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// A callback invoked once with the cause when a scope is cancelled.
pub type CancelCallback = Box<dyn FnOnce(&ShutdownCause) + Send>;

/// Pending callbacks keyed by registration id, so a child can remove its
/// entry from the parent when it no longer needs it.
#[derive(Default)]
struct Callbacks {
    next_id: u64,
    pending: BTreeMap<u64, CancelCallback>,
}

struct Inner {
    cancelled: AtomicBool,
    cause: Mutex<Option<ShutdownCause>>,
    callbacks: Mutex<Callbacks>,
    notify: Notify,
    deadline: Option<Instant>,
    /// The parent this scope is registered with, and the registration id.
    parent: Mutex<Option<(Weak<Inner>, u64)>>,
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            cause: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            notify: Notify::new(),
            deadline,
            parent: Mutex::new(None),
        }
    }

    fn cancel(&self, cause: ShutdownCause) -> bool {
        {
            let mut slot = self.cause.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause.clone());
            self.cancelled.store(true, Ordering::SeqCst);
        }
        self.notify.notify_waiters();
        self.detach();

        let callbacks = std::mem::take(&mut self.callbacks.lock().pending);
        for callback in callbacks.into_values() {
            run_callback(callback, &cause);
        }
        true
    }

    /// Registers `callback` unless already cancelled.
    ///
    /// Returns the registration id, or gives the callback back together with
    /// the cause so the caller can run it outside the lock.
    fn register(&self, callback: CancelCallback) -> Result<u64, (CancelCallback, ShutdownCause)> {
        let mut callbacks = self.callbacks.lock();
        // Checked under the callbacks lock so a concurrent cancel either sees
        // this callback or we see its cause.
        if let Some(cause) = self.cause.lock().clone() {
            return Err((callback, cause));
        }
        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.pending.insert(id, callback);
        Ok(id)
    }

    fn unregister(&self, id: u64) {
        self.callbacks.lock().pending.remove(&id);
    }

    /// Removes this scope's propagation callback from its parent.
    fn detach(&self) {
        let link = self.parent.lock().take();
        if let Some((parent, id)) = link {
            if let Some(parent) = parent.upgrade() {
                parent.unregister(id);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.detach();
    }
}

fn run_callback(callback: CancelCallback, cause: &ShutdownCause) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(cause);
    })) {
        warn!("Cancellation callback panicked: {:?}", e);
    }
}

/// A cancellable lifecycle scope carrying a single immutable cause.
///
/// Child scopes are cancelled with their parent's cause, unless they already
/// recorded one of their own. Cancelling a child never affects the parent.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Scope {
    /// Creates a root scope that is only cancelled explicitly.
    #[must_use]
    pub fn root() -> Self {
        Self {
            inner: Arc::new(Inner::new(None)),
        }
    }

    /// Derives an independently cancellable child scope.
    #[must_use]
    pub fn child(&self) -> Self {
        self.derive(self.inner.deadline)
    }

    /// Derives a child scope that cancels itself with
    /// [`ShutdownCause::DeadlineExceeded`] once `timeout` elapses.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        let child = self.derive(Some(deadline));

        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    timer.cancel(ShutdownCause::DeadlineExceeded { timeout });
                }
                _ = timer.cancelled() => {}
            }
        });

        child
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let child = Self {
            inner: Arc::new(Inner::new(deadline)),
        };
        let weak: Weak<Inner> = Arc::downgrade(&child.inner);
        let propagate: CancelCallback = Box::new(move |cause| {
            if let Some(inner) = weak.upgrade() {
                inner.cancel(cause.clone());
            }
        });
        match self.inner.register(propagate) {
            Ok(id) => {
                *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), id));
                // Cancelled between registering and linking: its cancel found
                // no link to remove, so drop the registration here.
                if child.is_cancelled() {
                    child.inner.detach();
                }
            }
            Err((callback, cause)) => run_callback(callback, &cause),
        }
        child
    }

    /// Cancels the scope with `cause`.
    ///
    /// Returns true if this call recorded the cause, false if the scope was
    /// already cancelled (the earlier cause is kept).
    pub fn cancel(&self, cause: ShutdownCause) -> bool {
        self.inner.cancel(cause)
    }

    /// Returns whether the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation cause, if cancelled.
    #[must_use]
    pub fn cause(&self) -> Option<ShutdownCause> {
        self.inner.cause.lock().clone()
    }

    /// Returns the deadline of this scope, if it (or an ancestor) has one.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Completes once the scope is cancelled and returns the cause.
    pub async fn cancelled(&self) -> ShutdownCause {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(cause) = self.cause() {
                return cause;
            }
            notified.await;
        }
    }

    /// Registers a callback to run when the scope is cancelled.
    ///
    /// If already cancelled, the callback is invoked immediately.
    /// Panics inside callbacks are logged and suppressed.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&ShutdownCause) + Send + 'static,
    {
        if let Err((callback, cause)) = self.inner.register(Box::new(callback)) {
            run_callback(callback, &cause);
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::root()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_scope_default_not_cancelled() {
        let scope = Scope::root();
        assert!(!scope.is_cancelled());
        assert!(scope.cause().is_none());
        assert!(scope.deadline().is_none());
    }

    #[test]
    fn test_scope_cancel_first_cause_wins() {
        let scope = Scope::root();
        assert!(scope.cancel(ShutdownCause::requested("first")));
        assert!(!scope.cancel(ShutdownCause::Signal));

        assert!(scope.is_cancelled());
        assert_eq!(
            scope.cause().map(|c| c.to_string()),
            Some("shutdown requested: first".to_string())
        );
    }

    #[test]
    fn test_child_inherits_parent_cause() {
        let parent = Scope::root();
        let child = parent.child();

        parent.cancel(ShutdownCause::requested("parent done"));

        assert!(child.is_cancelled());
        assert!(matches!(child.cause(), Some(ShutdownCause::Requested(r)) if r == "parent done"));
    }

    #[test]
    fn test_child_keeps_own_cause() {
        let parent = Scope::root();
        let child = parent.child();

        child.cancel(ShutdownCause::Signal);
        parent.cancel(ShutdownCause::requested("later"));

        assert!(child.cause().is_some_and(|c| c.is_signal()));
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let parent = Scope::root();
        let child = parent.child();

        child.cancel(ShutdownCause::Signal);

        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = Scope::root();
        parent.cancel(ShutdownCause::Signal);

        let child = parent.child();
        assert!(child.cause().is_some_and(|c| c.is_signal()));
    }

    #[test]
    fn test_on_cancel_runs_once() {
        let scope = Scope::root();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        scope.on_cancel(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scope.cancel(ShutdownCause::Signal);
        scope.cancel(ShutdownCause::Signal);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_cancel_after_cancellation() {
        let scope = Scope::root();
        scope.cancel(ShutdownCause::Signal);

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        scope.on_cancel(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let scope = Scope::root();
        scope.on_cancel(|_| panic!("Intentional panic"));

        scope.cancel(ShutdownCause::Signal);
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let scope = Scope::root();
        let waiter = scope.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        scope.cancel(ShutdownCause::requested("wake"));

        let cause = handle.await.unwrap();
        assert_eq!(cause.as_label(), "requested");
    }

    #[test]
    fn test_cancelled_pending_until_cancel() {
        let scope = Scope::root();
        let mut waiter = tokio_test::task::spawn(scope.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        scope.cancel(ShutdownCause::Signal);
        assert!(waiter.is_woken());
        let cause = tokio_test::assert_ready!(waiter.poll());
        assert!(cause.is_signal());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_cancelled() {
        let scope = Scope::root();
        scope.cancel(ShutdownCause::Signal);
        assert!(scope.cancelled().await.is_signal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_cancels_at_deadline() {
        let scope = Scope::root().with_timeout(Duration::from_secs(10));
        assert!(scope.deadline().is_some());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!scope.is_cancelled());

        let cause = scope.cancelled().await;
        assert!(matches!(
            cause,
            ShutdownCause::DeadlineExceeded { timeout } if timeout == Duration::from_secs(10)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_follows_parent_cancellation() {
        let parent = Scope::root();
        let scope = parent.with_timeout(Duration::from_secs(60));

        parent.cancel(ShutdownCause::Signal);
        assert!(scope.cancelled().await.is_signal());
    }

    fn pending_callbacks(scope: &Scope) -> usize {
        scope.inner.callbacks.lock().pending.len()
    }

    #[test]
    fn test_dropped_children_release_parent_callbacks() {
        let parent = Scope::root();
        for _ in 0..10_000 {
            let child = parent.child();
            let grandchild = child.child();
            assert_eq!(pending_callbacks(&child), 1);
            drop(grandchild);
            assert_eq!(pending_callbacks(&child), 0);
        }
        assert_eq!(pending_callbacks(&parent), 0);

        let kept = parent.child();
        assert_eq!(pending_callbacks(&parent), 1);
        parent.cancel(ShutdownCause::Signal);
        assert!(kept.is_cancelled());
        assert_eq!(pending_callbacks(&parent), 0);
    }

    #[test]
    fn test_cancelled_child_releases_parent_callback() {
        let parent = Scope::root();
        let children: Vec<Scope> = (0..100).map(|_| parent.child()).collect();
        assert_eq!(pending_callbacks(&parent), 100);

        for child in &children {
            child.cancel(ShutdownCause::requested("done"));
        }
        assert_eq!(pending_callbacks(&parent), 0);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_timeouts_release_parent_callbacks() {
        let parent = Scope::root();
        for _ in 0..1_000 {
            let _ = parent.with_timeout(Duration::from_millis(1));
        }
        let early = parent.with_timeout(Duration::from_secs(60));
        early.cancel(ShutdownCause::requested("early"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pending_callbacks(&parent), 0);
    }
}
