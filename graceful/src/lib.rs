//! # Graceful
//!
//! Coordinated shutdown for groups of long-running async tasks.
//!
//! A [`Coordinator`] runs every task registered with [`Coordinator::go`]
//! against a shared lifecycle [`Scope`]. The first task failure, or an
//! interrupt/termination signal, cancels that scope and records why. Waiting
//! on the coordinator then:
//!
//! - runs every cleanup callable registered with [`Coordinator::stop`],
//!   concurrently and under a bounded deadline,
//! - waits for all tasks to observe cancellation and exit,
//! - returns the cause together with the aggregated cleanup errors.
//!
//! What the application does with the result (exit code, logging) is up to it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use graceful::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = Coordinator::new(&Scope::root());
//!
//!     coordinator.go_named("server", |scope: Scope| async move {
//!         scope.cancelled().await;
//!         Ok(())
//!     });
//!     coordinator.stop_named("flush", |_deadline: Scope| async move {
//!         Ok(())
//!     });
//!
//!     let (cause, cleanup) = coordinator.wait_with_errors().await;
//!     eprintln!("stopped: {cause}");
//!     if let Err(errors) = cleanup {
//!         eprintln!("{errors}");
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod observability;
pub mod scope;
pub mod signals;


pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use errors::{CleanupErrors, CleanupFailure, CleanupFailureKind, ConfigError, ShutdownCause};
pub use scope::Scope;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cleanup::CleanupRegistry;
    pub use crate::config::GracefulConfig;
    pub use crate::coordinator::{Coordinator, CoordinatorBuilder};
    pub use crate::errors::{
        CleanupErrors, CleanupFailure, CleanupFailureKind, ConfigError, ShutdownCause,
    };
    pub use crate::events::{
        CollectingEventSink, EventSink, LifecycleEvent, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::scope::Scope;
    pub use crate::signals::{ManualSignal, NoSignals, OsSignals, SignalSource, SignalTrigger};
}
