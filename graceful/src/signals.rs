//! Sources of the external "terminate" event.
//!
//! A [`Coordinator`](crate::Coordinator) listens on exactly one
//! [`SignalSource`] and cancels its scope with
//! [`ShutdownCause::Signal`](crate::ShutdownCause::Signal) when it fires.
//!
//! ## Signals
//! [`OsSignals`] handles, on Unix platforms:
//! - `SIGINT` (Ctrl-C in terminal)
//! - `SIGTERM` (default kill signal, used by systemd/Kubernetes)
//!
//! On other platforms only `Ctrl-C` via [`tokio::signal::ctrl_c`] is awaited.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Something that completes once when the process should terminate.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Waits for the terminate event.
    ///
    /// Returns `Ok(())` when it arrives, or `Err` if the source could not be
    /// installed. Never expected to fire twice.
    async fn recv(&self) -> io::Result<()>;
}

/// Listens for the process' interrupt and termination signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignals;

#[async_trait]
impl SignalSource for OsSignals {
    #[cfg(unix)]
    async fn recv(&self) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv()  => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn recv(&self) -> io::Result<()> {
        tokio::signal::ctrl_c().await
    }
}

/// A source that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignals;

#[async_trait]
impl SignalSource for NoSignals {
    async fn recv(&self) -> io::Result<()> {
        std::future::pending().await
    }
}

/// A source fired by hand through its [`SignalTrigger`].
///
/// Useful in tests and for hosts that receive termination requests through
/// their own channel (an admin endpoint, a parent process).
#[derive(Debug)]
pub struct ManualSignal {
    rx: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Fires the paired [`ManualSignal`].
#[derive(Debug, Clone)]
pub struct SignalTrigger {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ManualSignal {
    /// Creates a source and the trigger that fires it.
    #[must_use]
    pub fn new() -> (Self, SignalTrigger) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            SignalTrigger {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
        )
    }
}

impl SignalTrigger {
    /// Fires the signal. Returns false if it already fired or the source is gone.
    pub fn fire(&self) -> bool {
        self.tx
            .lock()
            .take()
            .is_some_and(|tx| tx.send(()).is_ok())
    }
}

#[async_trait]
impl SignalSource for ManualSignal {
    async fn recv(&self) -> io::Result<()> {
        let rx = self.rx.lock().take();
        match rx {
            Some(rx) => match rx.await {
                Ok(()) => Ok(()),
                // Every trigger was dropped without firing.
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }
}
