use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Graceful shutdown coordinator for the submission worker
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Receiver that flips to `true` once shutdown starts
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    pub fn trigger(&self) {
        if !*self.sender.borrow() {
            info!("Initiating graceful shutdown");
        }
        self.sender.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait for SIGINT (or SIGTERM on unix), then trigger shutdown.
    pub async fn wait_for_signal(&self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on SIGINT/SIGTERM");

        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        self.trigger();
        Ok(())
    }

    /// Wait for in-flight work to finish, giving up after `grace`.
    pub async fn drain<F, T>(grace: Duration, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match timeout(grace, work).await {
            Ok(value) => {
                info!("Graceful shutdown completed successfully");
                Ok(value)
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "In-flight submissions did not finish in time");
                Err(anyhow::anyhow!(
                    "Timeout waiting for in-flight submissions after {}s",
                    grace.as_secs()
                ))
            }
        }
    }
}
