//! Process-wide runtime: the Tokio executor the synchronous FFI surface
//! drives, logging initialization and the shutdown signal handler.

use std::sync::{LazyLock, Once};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("wgtunnel")
        .build()
        .expect("Tokio runtime must build")
});

pub(crate) fn handle() -> &'static tokio::runtime::Runtime {
    &RUNTIME
}

/// Runs a future to completion from a synchronous entry point.
pub fn block_on<F: Future>(future: F) -> F::Output {
    RUNTIME.block_on(future)
}

/// One-time process setup: logging plus the SIGINT/SIGTERM handler that
/// tears every tunnel down before exiting. Called from every entry point;
/// only the first call does anything.
pub fn ensure_initialized() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        init_logging();
        RUNTIME.spawn(handle_shutdown_signals());
    });
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A host process may have installed its own subscriber; ours is
    // best-effort.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

async fn handle_shutdown_signals() {
    wait_for_terminate().await;

    tracing::info!("Termination signal received, closing all tunnels");
    crate::supervisor::turn_off_all_inner().await;
    crate::proxy::turn_off_all();
    std::process::exit(0);
}

#[cfg(unix)]
async fn wait_for_terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!("Failed to install SIGINT handler: {e}");
            return std::future::pending().await;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {e}");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(windows)]
async fn wait_for_terminate() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to wait for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
