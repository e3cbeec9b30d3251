//! Cancellation of a deployment run.
//!
//! A `Cancellation` is a cheap clonable view on a watch channel. Waits check it
//! between polls; the orchestrator and deployer check it before starting any
//! further stack operation. In-flight SDK calls are not interrupted.

use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: watch::Receiver<bool>,
}

/// The sending side. Dropping it without cancelling leaves every `Cancellation` pending forever.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

impl Cancellation {
    pub fn new() -> (CancelHandle, Cancellation) {
        let (sender, receiver) = watch::channel(false);
        return (CancelHandle { sender }, Cancellation { receiver });
    }

    /// A cancellation that never fires.
    pub fn never() -> Self {
        let (_, cancellation) = Self::new();
        return cancellation;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Returns a cancellation that fires on SIGINT (Ctrl+C) or SIGTERM.
pub fn cancel_on_signal() -> Cancellation {
    let (handle, cancellation) = Cancellation::new();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", error);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    warn!("Failed to install SIGTERM handler: {}", error);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling the current wait");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling the current wait");
            }
        }

        handle.cancel();
    });

    return cancellation;
}
