//! Background loop cleaning stale sessions and pruning the rate-limiter map.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::dispatch::rate_limit::RateLimiter;
use crate::session::registry::SessionRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn(registry: Arc<SessionRegistry>, rate_limiter: Arc<RateLimiter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the immediate first tick would sweep at startup, before anything
        // can be stale
        interval.tick().await;

        loop {
            interval.tick().await;
            let cleaned = registry.sweep_stale().await;
            if cleaned > 0 {
                debug!(cleaned, "stale session sweep");
            }
            rate_limiter.prune();
        }
    })
}
