//! Per-session event fan-out.
//!
//! Connections are channel-backed: each consumer owns the receiving half of
//! an unbounded channel, so per-connection ordering is the channel's FIFO
//! order. Sends are best-effort; a failed send disconnects that consumer and
//! leaves the rest untouched. A per-connection heartbeat task refreshes a
//! liveness timestamp that a periodic reaper checks.

use crate::domain::events::{Event, EventKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_HEARTBEAT_AGE: Duration = Duration::from_secs(300);

struct Connection {
    session_id: String,
    sender: UnboundedSender<Event>,
    last_heartbeat: Instant,
}

#[derive(Default)]
struct BusState {
    connections: HashMap<String, Connection>,
    sessions: HashMap<String, HashSet<String>>,
}

/// Session-keyed fan-out bus.
pub struct EventBus {
    state: Arc<RwLock<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState::default())),
        }
    }

    /// Registers a consumer for a session and starts its heartbeat task.
    /// Returns the connection id and the event stream.
    pub async fn connect(&self, session_id: &str) -> (String, UnboundedReceiver<Event>) {
        let connection_id = Uuid::new_v4().to_string();
        let (sender, receiver) = unbounded_channel();

        {
            let mut state = self.state.write().await;
            state.connections.insert(
                connection_id.clone(),
                Connection {
                    session_id: session_id.to_string(),
                    sender,
                    last_heartbeat: Instant::now(),
                },
            );
            state
                .sessions
                .entry(session_id.to_string())
                .or_default()
                .insert(connection_id.clone());
        }

        self.spawn_heartbeat(connection_id.clone());

        info!(
            "Consumer connected: connection_id={}, session_id={}",
            connection_id, session_id
        );
        (connection_id, receiver)
    }

    pub async fn disconnect(&self, connection_id: &str) {
        let mut state = self.state.write().await;
        let Some(connection) = state.connections.remove(connection_id) else {
            return;
        };
        if let Some(set) = state.sessions.get_mut(&connection.session_id) {
            set.remove(connection_id);
            if set.is_empty() {
                state.sessions.remove(&connection.session_id);
            }
        }
        info!(
            "Consumer disconnected: connection_id={}, session_id={}",
            connection_id, connection.session_id
        );
    }

    /// Sends one event to one consumer. A failed send (receiver gone)
    /// disconnects that consumer.
    pub async fn send_to_connection(&self, connection_id: &str, event: Event) -> bool {
        let failed = {
            let state = self.state.read().await;
            match state.connections.get(connection_id) {
                Some(connection) => connection.sender.send(event).is_err(),
                None => {
                    debug!("Cannot send to unknown connection: {}", connection_id);
                    return false;
                }
            }
        };
        if failed {
            warn!("Send failed, disconnecting: {}", connection_id);
            self.disconnect(connection_id).await;
            return false;
        }
        true
    }

    /// Broadcasts to every consumer of a session, in the runtime's emission
    /// order per consumer. Returns the number of successful sends.
    pub async fn broadcast_to_session(&self, session_id: &str, event: Event) -> usize {
        let connection_ids: Vec<String> = {
            let state = self.state.read().await;
            state
                .sessions
                .get(session_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for connection_id in connection_ids {
            if self.send_to_connection(&connection_id, event.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Convenience: wrap a payload in an envelope stamped now and broadcast.
    pub async fn publish(&self, session_id: &str, kind: EventKind) -> usize {
        self.broadcast_to_session(session_id, Event::new(kind)).await
    }

    pub async fn connection_count(&self, session_id: Option<&str>) -> usize {
        let state = self.state.read().await;
        match session_id {
            Some(id) => state.sessions.get(id).map(HashSet::len).unwrap_or(0),
            None => state.connections.len(),
        }
    }

    pub async fn is_connected(&self, connection_id: &str) -> bool {
        self.state.read().await.connections.contains_key(connection_id)
    }

    /// Disconnects consumers whose heartbeat is older than `max_age`.
    pub async fn cleanup_stale_connections(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = {
            let state = self.state.read().await;
            state
                .connections
                .iter()
                .filter(|(_, c)| c.last_heartbeat.elapsed() > max_age)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for connection_id in &stale {
            info!("Cleaning up stale connection: {}", connection_id);
            self.disconnect(connection_id).await;
        }
        stale.len()
    }

    /// Background reaper over all connections.
    pub fn spawn_reaper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = bus.cleanup_stale_connections(max_age).await;
                if reaped > 0 {
                    debug!("Reaper removed {} stale connections", reaped);
                }
            }
        })
    }

    fn spawn_heartbeat(&self, connection_id: String) {
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if !bus.is_connected(&connection_id).await {
                    break;
                }
                if !bus
                    .send_to_connection(&connection_id, Event::new(EventKind::Heartbeat {}))
                    .await
                {
                    warn!("Heartbeat failed for connection {}", connection_id);
                    break;
                }
                let mut state = bus.state.write().await;
                if let Some(connection) = state.connections.get_mut(&connection_id) {
                    connection.last_heartbeat = Instant::now();
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_count() {
        let bus = EventBus::new();
        assert_eq!(bus.connection_count(None).await, 0);

        let (id_a, _rx_a) = bus.connect("session-1").await;
        let (_id_b, _rx_b) = bus.connect("session-1").await;
        let (_id_c, _rx_c) = bus.connect("session-2").await;

        assert_eq!(bus.connection_count(None).await, 3);
        assert_eq!(bus.connection_count(Some("session-1")).await, 2);

        bus.disconnect(&id_a).await;
        assert_eq!(bus.connection_count(Some("session-1")).await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_scoped_to_session() {
        let bus = EventBus::new();
        let (_id_a, mut rx_a) = bus.connect("session-1").await;
        let (_id_b, mut rx_b) = bus.connect("session-2").await;

        let delivered = bus.publish("session-1", EventKind::AiThinking {
            session_id: "session-1".to_string(),
        })
        .await;
        assert_eq!(delivered, 1);

        let received = rx_a.recv().await.unwrap();
        assert!(matches!(received.kind, EventKind::AiThinking { .. }));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_per_consumer_order_preserved() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.connect("session-1").await;

        for i in 0..50i64 {
            bus.publish("session-1", EventKind::CountdownUpdate {
                seconds_remaining: i,
                next_candle_time: String::new(),
            })
            .await;
        }

        for expected in 0..50i64 {
            match rx.recv().await.unwrap().kind {
                EventKind::CountdownUpdate { seconds_remaining, .. } => {
                    assert_eq!(seconds_remaining, expected)
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_dead_consumer_disconnected_without_affecting_others() {
        let bus = EventBus::new();
        let (id_dead, rx_dead) = bus.connect("session-1").await;
        let (_id_live, mut rx_live) = bus.connect("session-1").await;

        drop(rx_dead);
        let delivered = bus
            .publish("session-1", EventKind::Heartbeat {})
            .await;

        assert_eq!(delivered, 1);
        assert!(!bus.is_connected(&id_dead).await);
        assert!(rx_live.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_stale_reaper() {
        let bus = EventBus::new();
        let (_id, _rx) = bus.connect("session-1").await;

        // Nothing is stale yet at a generous age.
        assert_eq!(bus.cleanup_stale_connections(Duration::from_secs(60)).await, 0);
        // Everything is stale at age zero.
        assert_eq!(bus.cleanup_stale_connections(Duration::ZERO).await, 1);
        assert_eq!(bus.connection_count(None).await, 0);
    }
}
