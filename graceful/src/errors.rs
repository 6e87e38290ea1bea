//! Error types for the graceful coordinator.
//!
//! Two kinds of failure surface from a shutdown:
//!
//! - [`ShutdownCause`] — why the lifecycle scope was cancelled (the first
//!   recorded reason wins).
//! - [`CleanupErrors`] — everything that went wrong while running the
//!   registered cleanup callables.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a lifecycle scope was cancelled.
///
/// Cloned freely: every reader of a cancelled scope sees the same cause.
#[derive(Debug, Clone, Error)]
pub enum ShutdownCause {
    /// An interrupt or termination signal reached the process.
    #[error("exit signal received")]
    Signal,

    /// A registered task returned an error.
    #[error("task `{name}` failed: {error}")]
    Task {
        /// Name of the failing task.
        name: String,
        /// The error the task returned.
        error: Arc<anyhow::Error>,
    },

    /// A registered task panicked.
    #[error("task `{name}` panicked: {message}")]
    TaskPanicked {
        /// Name of the panicking task.
        name: String,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// A scope created with a timeout reached its deadline.
    #[error("deadline of {timeout:?} exceeded")]
    DeadlineExceeded {
        /// The timeout the scope was created with.
        timeout: Duration,
    },

    /// Cancellation was requested explicitly by the application.
    #[error("shutdown requested: {0}")]
    Requested(String),
}

impl ShutdownCause {
    /// Builds a [`ShutdownCause::Task`] from a task name and its error.
    pub fn task(name: impl Into<String>, error: anyhow::Error) -> Self {
        Self::Task {
            name: name.into(),
            error: Arc::new(error),
        }
    }

    /// Builds a [`ShutdownCause::Requested`] with the given reason.
    pub fn requested(reason: impl Into<String>) -> Self {
        Self::Requested(reason.into())
    }

    /// Returns true if shutdown was started by an OS signal.
    #[must_use]
    pub const fn is_signal(&self) -> bool {
        matches!(self, Self::Signal)
    }

    /// Returns the task error, if a task failure caused the shutdown.
    #[must_use]
    pub fn task_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Task { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }

    /// Returns the name of the task that caused the shutdown, if any.
    #[must_use]
    pub fn task_name(&self) -> Option<&str> {
        match self {
            Self::Task { name, .. } | Self::TaskPanicked { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Signal => "signal_exit",
            Self::Task { .. } => "task_failed",
            Self::TaskPanicked { .. } => "task_panicked",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Requested(_) => "requested",
        }
    }
}

/// How a single cleanup callable failed.
#[derive(Debug, Error)]
pub enum CleanupFailureKind {
    /// The callable returned an error.
    #[error("{0}")]
    Failed(anyhow::Error),

    /// The callable panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The callable was still running when collection gave up on it.
    #[error("still running after the cleanup deadline")]
    TimedOut,
}

/// A failure of one named cleanup callable.
#[derive(Debug, Error)]
#[error("cleanup `{name}`: {kind}")]
pub struct CleanupFailure {
    /// Name of the cleanup callable.
    pub name: String,
    /// What went wrong.
    #[source]
    pub kind: CleanupFailureKind,
}

impl CleanupFailure {
    /// Creates a new cleanup failure.
    pub fn new(name: impl Into<String>, kind: CleanupFailureKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// The aggregated result of every failing cleanup callable.
///
/// Never empty: a shutdown where all cleanups succeed reports `Ok(())`.
#[derive(Debug)]
pub struct CleanupErrors {
    failures: Vec<CleanupFailure>,
}

impl CleanupErrors {
    /// Joins the given failures; returns `Ok(())` when there are none.
    pub fn join(failures: Vec<CleanupFailure>) -> Result<(), Self> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self { failures })
        }
    }

    /// Returns the individual failures.
    #[must_use]
    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }

    /// Returns the number of failed cleanup callables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Always false; kept for API symmetry with [`len`](Self::len).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns the failure recorded for the named callable, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CleanupFailure> {
        self.failures.iter().find(|f| f.name == name)
    }

    /// Returns true if any callable failed with an error of type `E`.
    #[must_use]
    pub fn contains<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.failures.iter().any(|f| match &f.kind {
            CleanupFailureKind::Failed(err) => err.downcast_ref::<E>().is_some(),
            _ => false,
        })
    }
}

impl fmt::Display for CleanupErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CleanupErrors {}

impl IntoIterator for CleanupErrors {
    type Item = CleanupFailure;
    type IntoIter = std::vec::IntoIter<CleanupFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}

/// Error raised when a [`GracefulConfig`](crate::config::GracefulConfig) is invalid.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// A duration field was negative, NaN or infinite.
    #[error("`{field}` must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration {
        /// The offending field.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// An environment variable could not be parsed.
    #[error("environment variable `{var}` has invalid value `{value}`")]
    InvalidEnv {
        /// The variable name.
        var: &'static str,
        /// The raw value.
        value: String,
    },
}
