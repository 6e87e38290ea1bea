//! The lifecycle coordinator.
//!
//! A [`Coordinator`] owns a lifecycle [`Scope`], the tasks registered with
//! [`go`](Coordinator::go) and the cleanup callables registered with
//! [`stop`](Coordinator::stop).
//!
//! ```text
//!  go(task) ──► spawn ──► task(scope) ── Err(e) ──┐
//!                                                 ├──► scope.cancel(cause)   (first cause wins)
//!  SignalSource::recv() ── Ok ── Signal ──────────┘
//!
//!  wait_with_errors():
//!    scope.cancelled().await
//!      └─► CleanupRegistry::run_all(timeout, grace)   (all cleanups, concurrently)
//!      └─► wait for the live-task count to reach zero
//!      └─► (cause, cleanup result)
//! ```
//!
//! Cancellation is cooperative. A task or cleanup that never looks at its
//! scope keeps running after the coordinator considers shutdown complete.

use crate::cleanup::{panic_message, CleanupRegistry};
use crate::config::GracefulConfig;
use crate::errors::{CleanupErrors, ShutdownCause};
use crate::events::{EventSink, LifecycleEvent, NoOpEventSink};
use crate::scope::Scope;
use crate::signals::{NoSignals, OsSignals, SignalSource};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Coordinates a group of long-running tasks and their shutdown.
///
/// Any task failure or a terminate signal cancels the shared scope; waiting
/// on the coordinator then runs every cleanup callable under a bounded
/// deadline and waits for all tasks to exit.
///
/// Must be created inside a Tokio runtime.
pub struct Coordinator {
    scope: Scope,
    config: GracefulConfig,
    cleanup: CleanupRegistry,
    tasks: Arc<TaskCounter>,
    next_id: AtomicUsize,
    events: Arc<dyn EventSink>,
    listener: JoinHandle<()>,
}

/// Builder for a [`Coordinator`].
pub struct CoordinatorBuilder {
    parent: Scope,
    config: GracefulConfig,
    signals: Option<Arc<dyn SignalSource>>,
    events: Arc<dyn EventSink>,
}

impl CoordinatorBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: GracefulConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the terminate-signal source.
    ///
    /// Without this, [`OsSignals`] is used (or [`NoSignals`] when
    /// `handle_signals` is off in the configuration).
    #[must_use]
    pub fn signals(mut self, source: impl SignalSource + 'static) -> Self {
        self.signals = Some(Arc::new(source));
        self
    }

    /// Sets the sink receiving lifecycle events.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Builds the coordinator and starts its signal listener.
    #[must_use]
    pub fn build(self) -> Coordinator {
        if let Err(e) = self.config.validate() {
            warn!(error = %e, "Invalid graceful config; falling back to defaults for invalid fields");
        }

        let scope = self.parent.child();
        let signals: Arc<dyn SignalSource> = match self.signals {
            Some(source) => source,
            None if self.config.handle_signals => Arc::new(OsSignals),
            None => Arc::new(NoSignals),
        };
        let listener = tokio::spawn(listen(signals, scope.clone()));

        Coordinator {
            scope,
            config: self.config,
            cleanup: CleanupRegistry::new(),
            tasks: Arc::new(TaskCounter::default()),
            next_id: AtomicUsize::new(0),
            events: self.events,
            listener,
        }
    }
}

/// Waits for the first terminate event and turns it into a shutdown.
///
/// A signal that is already pending is delivered even if the scope was
/// cancelled too; it then loses to the earlier cause.
async fn listen(source: Arc<dyn SignalSource>, scope: Scope) {
    tokio::select! {
        biased;
        result = source.recv() => match result {
            Ok(()) => {
                if scope.cancel(ShutdownCause::Signal) {
                    info!("Exit signal received, shutting down");
                } else {
                    debug!("Exit signal received after shutdown began; keeping the earlier cause");
                }
            }
            Err(e) => error!(error = %e, "Failed to install signal handlers"),
        },
        _ = scope.cancelled() => {}
    }
}

/// Counts tasks that have not exited and wakes waiters when none are left.
#[derive(Debug, Default)]
struct TaskCounter {
    live: AtomicUsize,
    idle: Notify,
}

impl TaskCounter {
    fn enter(self: &Arc<Self>) -> LiveTask {
        self.live.fetch_add(1, Ordering::SeqCst);
        LiveTask(Arc::clone(self))
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.live() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a running task; leaving the task (return, panic, abort) releases it.
struct LiveTask(Arc<TaskCounter>);

impl Drop for LiveTask {
    fn drop(&mut self) {
        if self.0.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Coordinator {
    /// Creates a coordinator bound to a child of `parent`, listening for OS signals.
    #[must_use]
    pub fn new(parent: &Scope) -> Self {
        Self::builder(parent).build()
    }

    /// Starts building a coordinator bound to a child of `parent`.
    #[must_use]
    pub fn builder(parent: &Scope) -> CoordinatorBuilder {
        CoordinatorBuilder {
            parent: parent.clone(),
            config: GracefulConfig::default(),
            signals: None,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Returns the lifecycle scope shared by all tasks.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope.clone()
    }

    /// Returns the configuration in use.
    #[must_use]
    pub fn config(&self) -> &GracefulConfig {
        &self.config
    }

    /// Returns the number of tasks that have not exited yet.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.tasks.live()
    }

    /// Returns the number of registered cleanup callables.
    #[must_use]
    pub fn cleanup_count(&self) -> usize {
        self.cleanup.pending_count()
    }

    fn next_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts a long-running task.
    ///
    /// An `Err` returned by the task cancels the scope with that error as the
    /// cause, unless a cause was already recorded. `Ok(())` cancels nothing.
    pub fn go<F, Fut>(&self, task: F)
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.go_named(self.next_name("task"), task);
    }

    /// Starts a long-running task with a name used in logs and causes.
    pub fn go_named<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let scope = self.scope.clone();
        let sink = self.events.clone();

        let live = self.tasks.enter();

        debug!(task = %name, "Starting task");
        sink.try_emit(LifecycleEvent::TaskStarted { task: name.clone() });

        // Detached: completion is tracked by `live`, so nothing is kept per task.
        tokio::spawn(async move {
            let _live = live;
            let task_scope = scope.clone();
            let result = AssertUnwindSafe(async move { task(task_scope).await })
                .catch_unwind()
                .await;

            let cause = match result {
                Ok(Ok(())) => {
                    debug!(task = %name, "Task exited");
                    return;
                }
                Ok(Err(e)) => {
                    warn!(task = %name, error = %e, "Task failed");
                    ShutdownCause::task(name.clone(), e)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(task = %name, panic = %message, "Task panicked");
                    ShutdownCause::TaskPanicked {
                        name: name.clone(),
                        message,
                    }
                }
            };

            let error = cause.to_string();
            if !scope.cancel(cause) {
                debug!(task = %name, "Scope already cancelled; keeping the earlier cause");
            }
            sink.emit(LifecycleEvent::TaskFailed { task: name, error }).await;
        });
    }

    /// Registers a cleanup callable, run once the scope is cancelled.
    pub fn stop<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stop_named(self.next_name("cleanup"), cleanup);
    }

    /// Registers a named cleanup callable.
    pub fn stop_named<F, Fut>(&self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanup.register(name, cleanup);
    }

    /// Cancels the scope with [`ShutdownCause::Requested`].
    ///
    /// Returns false if a cause was already recorded.
    pub fn shutdown(&self, reason: impl Into<String>) -> bool {
        self.scope.cancel(ShutdownCause::requested(reason))
    }

    /// Waits for shutdown and returns only its cause.
    pub async fn wait(self) -> ShutdownCause {
        self.wait_with_errors().await.0
    }

    /// Waits for the scope to be cancelled, runs every cleanup callable,
    /// then waits for every task to exit.
    ///
    /// Returns the cancellation cause and the aggregated cleanup result.
    /// Tasks registered after this point are not awaited.
    pub async fn wait_with_errors(self) -> (ShutdownCause, Result<(), CleanupErrors>) {
        let cause = self.scope.cancelled().await;
        let started = Instant::now();

        info!(
            cause = %cause,
            label = cause.as_label(),
            cleanups = self.cleanup.pending_count(),
            "Shutting down"
        );
        self.events
            .emit(LifecycleEvent::ShutdownStarted {
                cause: cause.to_string(),
                label: cause.as_label(),
                cleanups: self.cleanup.pending_count(),
            })
            .await;

        let cleanup = self
            .cleanup
            .run_all(self.config.cleanup_timeout(), self.config.cleanup_grace())
            .await;
        if let Err(errors) = &cleanup {
            for failure in errors.failures() {
                self.events
                    .emit(LifecycleEvent::CleanupFailed {
                        cleanup: failure.name.clone(),
                        error: failure.kind.to_string(),
                    })
                    .await;
            }
        }

        if self.tasks.live() > 0 {
            debug!(live = self.tasks.live(), "Waiting for tasks to exit");
        }
        self.tasks.idle().await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let failures = cleanup.as_ref().err().map_or(0, CleanupErrors::len);
        info!(
            cause = %cause,
            cleanup_failures = failures,
            duration_ms,
            "Shutdown complete"
        );
        self.events
            .emit(LifecycleEvent::ShutdownCompleted {
                cause: cause.to_string(),
                cleanup_failures: failures,
                duration_ms,
            })
            .await;

        (cause, cleanup)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("scope", &self.scope)
            .field("live_tasks", &self.live_tasks())
            .field("cleanup_count", &self.cleanup_count())
            .finish_non_exhaustive()
    }
}
