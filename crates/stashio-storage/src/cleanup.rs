//! Background expiration sweeps
//!
//! A [`CleanupTask`] calls [`StorageManager::trigger_cleanup`] on a fixed
//! interval. The task holds only a weak reference to the manager and exits
//! once the manager is gone; dropping the handle aborts it.

use crate::manager::StorageManager;
use stashio_common::{Error, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Handle to a running cleanup loop
pub struct CleanupTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Spawn the loop; the first sweep runs after `initial_delay`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        manager: &Arc<StorageManager>,
        interval: Duration,
        initial_delay: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::configuration("cleanup interval must be non-zero"));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(cleanup_loop(
            Arc::downgrade(manager),
            interval,
            initial_delay,
            shutdown_rx,
        ));

        info!(
            "Started background cleanup every {:?} (first run in {:?})",
            interval, initial_delay
        );
        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Check whether the loop is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to exit
    ///
    /// A sweep already in progress is allowed to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn cleanup_loop(
    manager: Weak<StorageManager>,
    interval: Duration,
    initial_delay: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Some(report) = manager.trigger_cleanup().await {
                    debug!(
                        "Cleanup sweep: scanned={} removed={} pruned={} in {:?}",
                        report.scanned, report.removed, report.pruned, report.duration
                    );
                }
            }
        }
    }

    info!("Background cleanup stopped");
}
