//! Periodic removal of expired rolling-cache entries.
//!
//! Expiry is already enforced on read, so sweeping only reclaims memory. The
//! task is owned by whoever starts it and stops when told to.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::RecentWindows;

pub struct Sweeper {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn start(cache: RecentWindows, every: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sweep_once(&cache).await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("cache sweeper stopped");
        });

        Self { stop_tx, handle }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "cache sweeper ended abnormally");
        }
    }
}

pub async fn sweep_once(cache: &RecentWindows) -> usize {
    let removed = cache.sweep().await;
    if removed > 0 {
        tracing::debug!(removed, "expired cache entries swept");
    }
    removed
}
