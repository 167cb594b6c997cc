use super::DocumentCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run [`DocumentCache::clear_expired`] every `period` until `token` is cancelled.
///
/// The first sweep happens one full period after spawning; opening the cache
/// already swept once.
pub fn spawn_expiry_sweep(
    cache: Arc<DocumentCache>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    // Store writes may block on a file lock.
                    let sweeping = Arc::clone(&cache);
                    match tokio::task::spawn_blocking(move || sweeping.clear_expired()).await {
                        Ok(removed) => tracing::debug!(removed, "periodic expiry sweep"),
                        Err(err) => tracing::warn!("expiry sweep failed: {err}"),
                    }
                }
            }
        }
    })
}
