//! Background blacklist synchronization.
//!
//! Runs a sync cycle (pull, then push) periodically until stopped.

use crate::blacklist::Blacklist;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Handle to the running sync task.
#[derive(Debug)]
pub struct SyncTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncTask {
    /// Stop the task and wait until it has exited.
    ///
    /// A cycle already in progress is allowed to finish; the task then
    /// makes one last publish attempt before returning.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Blacklist sync task failed: {}", e);
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn the background sync task for `blacklist`.
pub fn spawn_sync_task(blacklist: Arc<Blacklist>, period: Duration) -> SyncTask {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        tracing::info!("Blacklist sync started (interval: {:?})", period);

        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => {}
            }

            match blacklist.sync().await {
                Ok(true) => tracing::debug!("Blacklist sync: published local changes"),
                Ok(false) => {}
                Err(e) => tracing::warn!("Blacklist sync error: {}", e),
            }
        }

        if let Err(e) = blacklist.push().await {
            tracing::warn!("Final blacklist publish failed: {}", e);
        }
        tracing::info!("Blacklist sync stopped");
    });

    SyncTask { cancel, handle }
}
