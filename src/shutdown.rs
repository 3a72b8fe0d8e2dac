//! Graceful shutdown plumbing: one flag, many watchers.

use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info};

/// Fans a single shutdown decision out to every component. Subscribers see
/// the flag flip exactly once; late subscribers see it already set.
#[derive(Clone)]
pub struct ShutdownManager {
    tx: watch::Sender<bool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn shutdown(&self) {
        if *self.tx.borrow() {
            debug!("shutdown already triggered");
            return;
        }
        info!("triggering shutdown");
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Block until SIGINT (Ctrl+C) or, on unix, SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_the_flip() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        assert!(!*rx.borrow());

        manager.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        // Late subscribers see the flag already set.
        assert!(*manager.subscribe().borrow());
        // A second trigger is a no-op.
        manager.shutdown();
    }
}
