//! Shutdown coordinator.
//!
//! Signal → stop accepting → cancel workers → stop and remove owned
//! containers → close the store. A hard deadline bounds the whole drain;
//! past it the process aborts rather than hang.

use std::time::Duration;

use islet_db::Database;
use islet_kernel::{ContainerRuntime, IsletKernel};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Flips the shutdown flag on SIGINT/SIGTERM.
pub async fn signal_listener(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "could not listen for ctrl-c");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "could not listen for SIGTERM");
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("termination signal received; shutting down");
    let _ = tx.send(true);
}

/// Resolves once the shutdown flag flips.
pub async fn wait_for_flag(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Post-serve drain: workers, containers, store.
pub async fn drain<R>(kernel: IsletKernel<R>, db: Database, workers: Vec<JoinHandle<()>>)
where
    R: ContainerRuntime,
{
    let cleanup = async {
        for handle in workers {
            handle.abort();
        }
        kernel.sandboxes().shutdown_cleanup().await;
        db.close().await;
    };

    if tokio::time::timeout(SHUTDOWN_DEADLINE, cleanup).await.is_err() {
        error!(
            deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
            "shutdown deadline exceeded; aborting"
        );
        std::process::exit(1);
    }
    info!("shutdown complete");
}
