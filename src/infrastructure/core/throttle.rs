//! Process-wide request-start throttle.
//!
//! All LLM requests in the process share one start-time slot, guarded by a
//! mutex that stays held through the catch-up sleep. Consecutive request
//! starts are therefore at least the configured interval apart, regardless
//! of how many sessions are running.

use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

static LAST_REQUEST_START: LazyLock<Mutex<Option<Instant>>> = LazyLock::new(|| Mutex::new(None));

/// Blocks until at least `min_interval` has passed since the previous
/// request start, then claims the slot.
pub async fn throttle_request_start(min_interval: Duration) {
    let mut last = LAST_REQUEST_START.lock().await;
    if let Some(previous) = *last {
        let elapsed = previous.elapsed();
        if elapsed < min_interval {
            let wait = min_interval - elapsed;
            debug!("Throttling API request: waiting {:?}", wait);
            sleep(wait).await;
        }
    }
    *last = Some(Instant::now());
}
