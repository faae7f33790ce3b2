//! Shared session-runtime machinery: controls, state, overrides, the active
//! session registry, and reconnect replay.

pub mod controls;
pub mod overrides;
pub mod recovery;
pub mod state;

pub use controls::SessionControls;
pub use state::{DecisionCadence, EquityPoint, SessionState};

use crate::domain::events::Event;
use crate::domain::repositories::SessionType;
use crate::infrastructure::event_bus::EventBus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

const REPLAY_BATCH_SIZE: usize = 50;
const REPLAY_BATCH_DELAY: Duration = Duration::from_millis(10);
/// Forward sessions give candles a moment to render before decisions.
const REPLAY_DECISION_PAUSE: Duration = Duration::from_millis(500);

/// Events a late-joining consumer must be caught up with, in original
/// emission order and with their original payloads and timestamps.
#[derive(Default)]
pub struct ReplayBuffer {
    candles: RwLock<Vec<Event>>,
    decisions: RwLock<Vec<Event>>,
}

impl ReplayBuffer {
    pub async fn push_candle(&self, event: Event) {
        self.candles.write().await.push(event);
    }

    pub async fn push_decision(&self, event: Event) {
        self.decisions.write().await.push(event);
    }

    pub async fn candle_events(&self) -> Vec<Event> {
        self.candles.read().await.clone()
    }

    pub async fn decision_events(&self) -> Vec<Event> {
        self.decisions.read().await.clone()
    }
}

/// The cross-task face of a running session: control surface plus replay
/// data. The mutable `SessionState` itself stays inside the driver task.
pub struct SessionHandle {
    pub session_type: SessionType,
    pub controls: SessionControls,
    pub replay: ReplayBuffer,
}

impl SessionHandle {
    pub fn new(session_type: SessionType) -> Arc<Self> {
        Arc::new(Self {
            session_type,
            controls: SessionControls::new(),
            replay: ReplayBuffer::default(),
        })
    }
}

/// Registry of in-memory session runtimes, keyed by session id.
#[derive(Clone, Default)]
pub struct ActiveSessionMap {
    inner: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
}

impl ActiveSessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session_id: &str, handle: Arc<SessionHandle>) {
        self.inner.write().await.insert(session_id.to_string(), handle);
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.write().await.remove(session_id)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.read().await.contains_key(session_id)
    }
}

/// Streams a session's processed history to one reconnecting consumer:
/// candle events in small batches, then past decisions (after a short pause
/// for forward sessions so the chart renders first). New live events queue
/// behind these on the same per-connection channel, preserving order.
pub async fn replay_to_connection(bus: &EventBus, handle: &SessionHandle, connection_id: &str) {
    let candles = handle.replay.candle_events().await;
    if candles.is_empty() {
        debug!("No historical candles to replay to {}", connection_id);
        return;
    }

    info!(
        "Replaying {} historical candles to connection {}",
        candles.len(),
        connection_id
    );
    for batch in candles.chunks(REPLAY_BATCH_SIZE) {
        for event in batch {
            if !bus.send_to_connection(connection_id, event.clone()).await {
                return;
            }
        }
        tokio::time::sleep(REPLAY_BATCH_DELAY).await;
    }

    let decisions = handle.replay.decision_events().await;
    if decisions.is_empty() {
        return;
    }
    if handle.session_type == SessionType::Forward {
        tokio::time::sleep(REPLAY_DECISION_PAUSE).await;
    }
    info!(
        "Replaying {} historical decisions to connection {}",
        decisions.len(),
        connection_id
    );
    for event in decisions {
        if !bus.send_to_connection(connection_id, event).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventKind;

    #[tokio::test]
    async fn test_active_map_round_trip() {
        let map = ActiveSessionMap::new();
        let handle = SessionHandle::new(SessionType::Backtest);

        map.insert("s1", handle.clone()).await;
        assert!(map.contains("s1").await);
        assert!(map.get("s1").await.is_some());

        map.remove("s1").await;
        assert!(!map.contains("s1").await);
    }

    #[tokio::test]
    async fn test_replay_preserves_order_before_live_events() {
        let bus = EventBus::new();
        let handle = SessionHandle::new(SessionType::Backtest);

        for i in 0..3i64 {
            handle
                .replay
                .push_candle(Event::new(EventKind::CountdownUpdate {
                    seconds_remaining: i,
                    next_candle_time: String::new(),
                }))
                .await;
        }

        let (connection_id, mut rx) = bus.connect("s1").await;
        replay_to_connection(&bus, &handle, &connection_id).await;
        // A live event published after replay lands behind the history.
        bus.publish("s1", EventKind::Heartbeat {}).await;

        for expected in 0..3i64 {
            match rx.recv().await.unwrap().kind {
                EventKind::CountdownUpdate { seconds_remaining, .. } => {
                    assert_eq!(seconds_remaining, expected)
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(matches!(rx.recv().await.unwrap().kind, EventKind::Heartbeat {}));
    }
}
