//! Cleanup registry and the bounded shutdown sequence.

use crate::errors::{CleanupErrors, CleanupFailure, CleanupFailureKind, ShutdownCause};
use crate::scope::Scope;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A boxed cleanup callable.
pub type CleanupFn = Box<dyn FnOnce(Scope) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Registry of named cleanup callables, run concurrently on shutdown.
///
/// There is no ordering among callables; each must be safe to run
/// alongside the others.
#[derive(Default)]
pub struct CleanupRegistry {
    callbacks: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupRegistry {
    /// Creates a new cleanup registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup callable.
    pub fn register<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: CleanupFn = Box::new(move |scope| callback(scope).boxed());
        self.callbacks.lock().push((name.into(), boxed));
    }

    /// Returns the number of pending cleanup callables.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Runs every registered callable concurrently and drains the registry.
    ///
    /// All callables share a fresh root scope cancelled after `timeout`.
    /// Results are collected until `timeout + grace`; callables still running
    /// then are reported as [`CleanupFailureKind::TimedOut`] and left to
    /// finish (or not) on their own.
    pub async fn run_all(&self, timeout: Duration, grace: Duration) -> Result<(), CleanupErrors> {
        let callbacks: Vec<_> = std::mem::take(&mut *self.callbacks.lock());
        if callbacks.is_empty() {
            return Ok(());
        }

        let scope = Scope::root().with_timeout(timeout);
        let collect_until = Instant::now() + timeout + grace;
        let failures: Arc<Mutex<Vec<CleanupFailure>>> = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = callbacks
            .into_iter()
            .map(|(name, callback)| {
                let scope = scope.clone();
                let failures = failures.clone();
                let task_name = name.clone();
                let handle = tokio::spawn(async move {
                    let result = AssertUnwindSafe(async move { callback(scope).await })
                        .catch_unwind()
                        .await;
                    let kind = match result {
                        Ok(Ok(())) => {
                            debug!(cleanup = %task_name, "Cleanup completed");
                            return;
                        }
                        Ok(Err(e)) => CleanupFailureKind::Failed(e),
                        Err(panic) => CleanupFailureKind::Panicked(panic_message(panic.as_ref())),
                    };
                    warn!(cleanup = %task_name, error = %kind, "Cleanup failed");
                    failures.lock().push(CleanupFailure::new(task_name, kind));
                });
                (name, handle)
            })
            .collect();

        for (name, handle) in handles {
            match tokio::time::timeout_at(collect_until, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!(cleanup = %name, error = %join_err, "Cleanup task join error");
                    failures.lock().push(CleanupFailure::new(
                        name,
                        CleanupFailureKind::Panicked(join_err.to_string()),
                    ));
                }
                Err(_) => {
                    warn!(cleanup = %name, ?timeout, "Cleanup ignored its deadline");
                    failures
                        .lock()
                        .push(CleanupFailure::new(name, CleanupFailureKind::TimedOut));
                }
            }
        }

        scope.cancel(ShutdownCause::requested("cleanup finished"));

        let failures = std::mem::take(&mut *failures.lock());
        CleanupErrors::join(failures)
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(10);
    const GRACE: Duration = Duration::from_millis(500);

    #[test]
    fn test_registry_register() {
        let registry = CleanupRegistry::new();
        assert_eq!(registry.pending_count(), 0);

        registry.register("flush", |_scope| async { Ok(()) });
        assert_eq!(registry.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_is_ok() {
        let registry = CleanupRegistry::new();
        assert!(registry.run_all(TIMEOUT, GRACE).await.is_ok());
    }

    #[tokio::test]
    async fn test_registry_clears_after_run() {
        let registry = CleanupRegistry::new();
        registry.register("noop", |_scope| async { Ok(()) });

        registry.run_all(TIMEOUT, GRACE).await.unwrap();
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_continues_on_failure() {
        let registry = CleanupRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c1 = counter.clone();
        registry.register("first", move |_scope| async move {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.register("broken", |_scope| async { Err(anyhow::anyhow!("close failed")) });
        let c2 = counter.clone();
        registry.register("third", move |_scope| async move {
            c2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = registry.run_all(TIMEOUT, GRACE).await.unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(err.len(), 1);
        assert_eq!(err.to_string(), "cleanup `broken`: close failed");
    }

    async fn explode(_scope: Scope) -> anyhow::Result<()> {
        panic!("Intentional")
    }

    #[tokio::test]
    async fn test_panic_recorded_as_failure() {
        let registry = CleanupRegistry::new();
        registry.register("explodes", explode);

        let err = registry.run_all(TIMEOUT, GRACE).await.unwrap_err();
        let failure = err.get("explodes").unwrap();
        assert!(matches!(&failure.kind, CleanupFailureKind::Panicked(m) if m == "Intentional"));
    }

    #[tokio::test]
    async fn test_callables_run_concurrently() {
        let registry = CleanupRegistry::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        for name in ["a", "b"] {
            let barrier = barrier.clone();
            registry.register(name, move |_scope| async move {
                // Deadlocks unless both run at the same time.
                barrier.wait().await;
                Ok(())
            });
        }

        assert!(registry.run_all(TIMEOUT, GRACE).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_cancelled_at_deadline() {
        let registry = CleanupRegistry::new();
        registry.register("slow", |scope: Scope| async move {
            let cause = scope.cancelled().await;
            Err(anyhow::anyhow!("interrupted: {cause}"))
        });

        let err = registry
            .run_all(Duration::from_secs(2), GRACE)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cleanup `slow`: interrupted: deadline of 2s exceeded"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_deadline_reported_as_timeout() {
        let registry = CleanupRegistry::new();
        let done = Arc::new(AtomicUsize::new(0));

        registry.register("stuck", |_scope| async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let d = done.clone();
        registry.register("quick", move |_scope| async move {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.register("failing", |_scope| async { Err(anyhow::anyhow!("boom")) });

        let err = registry
            .run_all(Duration::from_secs(1), GRACE)
            .await
            .unwrap_err();

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(err.len(), 2);
        assert!(matches!(err.get("stuck").unwrap().kind, CleanupFailureKind::TimedOut));
        assert!(err.get("failing").is_some());
        assert!(err.get("quick").is_none());
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "<non-string panic payload>");
    }
}
