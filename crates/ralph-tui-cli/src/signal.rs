//! Ambient-signal shutdown, per spec.md §9's design note: "One explicit
//! signal handler registered by the top-level supervisor; it calls
//! `engine.stop()` and `executor.stop()`; double-signal within 1s escalates
//! to force-exit." No callbacks are stored on the engine itself — the
//! supervisor owns the `Arc`s it needs and reacts to its own subscription.

use std::sync::Arc;
use std::time::Duration;

use ralph_tui_core::engine::ExecutionEngine;
use ralph_tui_core::parallel::ParallelExecutor;
use tracing::{info, warn};

const ESCALATION_WINDOW: Duration = Duration::from_secs(1);

/// Wait for SIGINT/SIGTERM; on the first signal ask `engine` (and, if
/// running, `executor`) to stop gracefully; on a second signal within
/// [`ESCALATION_WINDOW`], force-exit the process immediately.
pub async fn wait_for_shutdown(engine: Arc<ExecutionEngine>, executor: Option<Arc<ParallelExecutor>>) {
    wait_for_signal().await;
    info!("shutdown signal received, stopping engine gracefully");
    engine.stop().await;
    if let Some(executor) = &executor {
        executor.stop().await;
    }

    tokio::select! {
        _ = wait_for_signal() => {
            warn!("second shutdown signal received, forcing exit");
            std::process::exit(130);
        }
        _ = tokio::time::sleep(ESCALATION_WINDOW) => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
