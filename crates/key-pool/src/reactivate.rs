//! Background reactivation sweep
//!
//! Spawns a periodic task that restores credentials whose cooldown has
//! elapsed. Runs independently of the request path, so a disabled key comes
//! back even when no traffic arrives.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::pool::KeyPool;

/// Spawn a background task that reactivates cooled-down credentials.
///
/// Every `interval` the task sweeps the pool and restores credentials that
/// have been disabled for at least `threshold`. Each sweep holds the pool
/// lock only for one pass over the credentials.
///
/// Panics if `interval` is zero (configuration validation rejects that).
/// Returns a `JoinHandle`; abort it on shutdown.
pub fn spawn_reactivation_task(
    pool: Arc<KeyPool>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, nothing can be disabled yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let restored = pool.reactivate_sweep(Instant::now(), threshold).await;
            debug!(restored, "reactivation sweep finished");
        }
    })
}
