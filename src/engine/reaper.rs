use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use super::registry::ActiveRunRegistry;

/// Periodically abort runs that have streamed longer than `max_age` without
/// a terminal event. Abort the returned handle to stop reaping.
pub fn spawn_reaper(
    registry: Arc<ActiveRunRegistry>,
    interval: Duration,
    max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = registry.abort_older_than(max_age, Instant::now());
            if !reaped.is_empty() {
                tracing::warn!(
                    count = reaped.len(),
                    channels = %reaped.join(","),
                    max_age_secs = max_age.as_secs(),
                    "Reaper aborted stale runs"
                );
            }
        }
    })
}
