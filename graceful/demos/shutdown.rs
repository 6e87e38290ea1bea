//! A hosting `main` built around a coordinator.
//!
//! Run with `cargo run --example shutdown` and press Ctrl-C, or wait for the
//! flaky worker to fail on its own.

use graceful::observability::init_tracing;
use graceful::prelude::*;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing("info");

    let config = match GracefulConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let coordinator = Coordinator::builder(&Scope::root())
        .config(config)
        .event_sink(std::sync::Arc::new(LoggingEventSink::default()))
        .build();

    coordinator.go_named("ticker", |scope: Scope| async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                _ = interval.tick() => info!("tick"),
            }
        }
    });

    coordinator.go_named("flaky-worker", |scope: Scope| async move {
        tokio::select! {
            _ = scope.cancelled() => Ok(()),
            () = tokio::time::sleep(Duration::from_secs(5)) => {
                Err(anyhow::anyhow!("upstream connection reset"))
            }
        }
    });

    coordinator.stop_named("flush-buffers", |_deadline: Scope| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!("buffers flushed");
        Ok(())
    });

    coordinator.stop_named("close-database", |deadline: Scope| async move {
        tokio::select! {
            _ = deadline.cancelled() => Err(anyhow::anyhow!("database close interrupted")),
            () = tokio::time::sleep(Duration::from_millis(100)) => Ok(()),
        }
    });

    let (cause, cleanup) = coordinator.wait_with_errors().await;
    info!(cause = %cause, "stopped");

    if let Err(errors) = &cleanup {
        eprintln!("cleanup errors:\n{errors}");
    }

    match (&cause, cleanup) {
        (ShutdownCause::Signal, Ok(())) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
