//! Candle-close timing for forward sessions: boundary-aligned waits with
//! countdown updates, plus the per-second mark-price stream.

use crate::application::session::SessionControls;
use crate::domain::events::EventKind;
use crate::domain::market::{Candle, Timeframe};
use crate::domain::ports::MarketDataGateway;
use crate::infrastructure::event_bus::EventBus;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Countdown updates are emitted at most this far apart.
const COUNTDOWN_MAX_INTERVAL_SECS: i64 = 30;
/// Grace poll interval once the boundary has passed but the vendor has not
/// published the closed candle yet.
const CANDLE_NOT_READY_RETRY: Duration = Duration::from_secs(10);
const PRICE_STREAM_INTERVAL: Duration = Duration::from_secs(1);

/// Waits for the next candle close, emitting `countdown_update` events while
/// waiting. Returns the newly closed candle, or None when the session was
/// stopped mid-wait.
pub async fn wait_for_candle_close(
    bus: &EventBus,
    session_id: &str,
    controls: &SessionControls,
    gateway: &Arc<dyn MarketDataGateway>,
    asset: &str,
    timeframe: Timeframe,
    last_candle_at: Option<DateTime<Utc>>,
) -> Result<Option<Candle>> {
    let mut next_close = timeframe.next_close_after(Utc::now());
    info!(
        "Waiting for candle close: session_id={}, next_close={}",
        session_id,
        next_close.to_rfc3339()
    );

    while !controls.is_stopped() {
        let seconds_remaining = (next_close - Utc::now()).num_seconds();

        if seconds_remaining <= 0 {
            match gateway.latest_closed(asset, timeframe).await {
                Ok(Some(candle)) => {
                    let is_new = last_candle_at.is_none_or(|last| candle.timestamp > last);
                    if is_new {
                        info!(
                            "New candle detected: session_id={}, timestamp={}",
                            session_id,
                            candle.timestamp.to_rfc3339()
                        );
                        return Ok(Some(candle));
                    }
                    debug!("Candle not ready yet: session_id={}, waiting", session_id);
                }
                Ok(None) => {
                    debug!("No closed candle available yet: session_id={}", session_id);
                }
                Err(e) => {
                    warn!("Error fetching latest candle: {e:#}");
                }
            }
            sleep_or_stop(controls, CANDLE_NOT_READY_RETRY).await;
            next_close = timeframe.next_close_after(Utc::now());
            continue;
        }

        bus.publish(
            session_id,
            EventKind::CountdownUpdate {
                seconds_remaining,
                next_candle_time: next_close.to_rfc3339(),
            },
        )
        .await;

        let wait = seconds_remaining.clamp(1, COUNTDOWN_MAX_INTERVAL_SECS) as u64;
        sleep_or_stop(controls, Duration::from_secs(wait)).await;
    }

    Ok(None)
}

/// Streams the current mark price every second until the session stops.
pub async fn stream_prices(
    bus: EventBus,
    session_id: String,
    handle: Arc<crate::application::session::SessionHandle>,
    gateway: Arc<dyn MarketDataGateway>,
    asset: String,
) {
    info!("Starting real-time price stream: session_id={}", session_id);
    loop {
        if handle.controls.is_stopped() {
            break;
        }
        match gateway.current_price(&asset).await {
            Ok(Some(ticker)) => {
                bus.publish(
                    &session_id,
                    EventKind::PriceUpdate {
                        price: ticker.price,
                        high_24h: ticker.high_24h,
                        low_24h: ticker.low_24h,
                        volume_24h: ticker.volume_24h,
                        change_24h: ticker.change_24h,
                        change_pct_24h: ticker.change_pct_24h,
                    },
                )
                .await;
            }
            Ok(None) => {}
            Err(e) => debug!("Price fetch failed: {e:#}"),
        }
        sleep_or_stop(&handle.controls, PRICE_STREAM_INTERVAL).await;
    }
    info!("Price stream ended: session_id={}", session_id);
}

/// Sleeps for `duration`, waking early if the session stops.
async fn sleep_or_stop(controls: &SessionControls, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = controls.stopped() => {}
    }
}
