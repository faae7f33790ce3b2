use crate::domain::market::Candle;
use crate::domain::trading::TradingStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Indicator name to value map for one candle. `None` is the JSON `null` a
/// consumer sees for indicators that are still warming up (or NaN).
pub type IndicatorMap = BTreeMap<String, Option<f64>>;

/// Typed payloads of the events streamed to session consumers.
///
/// Serializes adjacently tagged, so together with the envelope below the wire
/// shape is `{"type": ..., "data": {...}, "timestamp": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    SessionInitialized {
        session_id: String,
        agent_name: String,
        agent_mode: String,
        asset: String,
        timeframe: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_candles: Option<usize>,
    },
    SessionPaused {
        session_id: String,
        current_index: usize,
    },
    SessionResumed {
        session_id: String,
        current_index: usize,
    },
    SessionCompleted {
        session_id: String,
        result_id: String,
        final_equity: f64,
        total_pnl: f64,
        total_pnl_pct: f64,
        total_trades: usize,
        win_rate: f64,
        forced_stop: bool,
        auto_stop: bool,
    },
    Candle {
        candle: Candle,
        indicators: IndicatorMap,
        /// Position in the session's candle stream. Forward warm-up candles
        /// are numbered negatively, counting back from the first live candle.
        candle_number: i64,
    },
    AiThinking {
        session_id: String,
    },
    AiDecision {
        candle_number: i64,
        action: String,
        reasoning: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry_price: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss_price: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        take_profit_price: Option<f64>,
        size_percentage: f64,
        leverage: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        council_deliberation: Option<serde_json::Value>,
    },
    PositionOpened {
        candle_number: i64,
        side: String,
        entry_price: f64,
        size: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        take_profit: Option<f64>,
        leverage: u8,
    },
    PositionClosed {
        candle_number: i64,
        side: String,
        entry_price: f64,
        exit_price: f64,
        size: f64,
        pnl: f64,
        pnl_pct: f64,
        reason: String,
        leverage: u8,
    },
    StatsUpdate(StatsUpdatePayload),
    CountdownUpdate {
        seconds_remaining: i64,
        next_candle_time: String,
    },
    IndicatorReadiness {
        ready_count: usize,
        total_count: usize,
        ready_pct: f64,
        is_ready: bool,
    },
    PriceUpdate {
        price: f64,
        #[serde(rename = "high24h")]
        high_24h: f64,
        #[serde(rename = "low24h")]
        low_24h: f64,
        #[serde(rename = "volume24h")]
        volume_24h: f64,
        #[serde(rename = "change24h")]
        change_24h: f64,
        #[serde(rename = "changePct24h")]
        change_pct_24h: f64,
    },
    Heartbeat {},
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    CommandAck {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_id: Option<String>,
    },
}

/// `stats_update` payload: the aggregate statistics spread at the top level
/// of `data`, plus progress counters where the session has them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsUpdatePayload {
    #[serde(flatten)]
    pub stats: TradingStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_candle: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_candles: Option<usize>,
}

/// Wire envelope: the tagged payload plus a UTC timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn default_close_position() -> bool {
    true
}

/// Commands consumers send back over a session connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Pause,
    Resume,
    Stop {
        #[serde(default = "default_close_position")]
        close_position: bool,
    },
    Ping,
}

impl Command {
    pub fn action_name(&self) -> &'static str {
        match self {
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop { .. } => "stop",
            Command::Ping => "ping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_wire_shape() {
        let event = Event {
            kind: EventKind::Heartbeat {},
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value["data"].is_object());
        assert_eq!(value["timestamp"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_event_decode_encode_round_trip() {
        let mut indicators = IndicatorMap::new();
        indicators.insert("rsi".to_string(), Some(54.2));
        indicators.insert("macd".to_string(), None);

        let event = Event {
            kind: EventKind::Candle {
                candle: Candle::new(
                    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                    100.0,
                    101.0,
                    99.0,
                    100.5,
                    12.0,
                )
                .unwrap(),
                indicators,
                candle_number: 42,
            },
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
        };

        let json = event.to_json();
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);

        // Field set and values survive a second encoding unchanged.
        let reencoded: serde_json::Value = serde_json::from_str(&decoded.to_json()).unwrap();
        let original: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn test_null_indicator_survives_wire() {
        let mut indicators = IndicatorMap::new();
        indicators.insert("atr".to_string(), None);
        let event = Event::new(EventKind::Candle {
            candle: Candle::new(Utc::now(), 1.0, 1.0, 1.0, 1.0, 0.0).unwrap(),
            indicators,
            candle_number: 0,
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert!(value["data"]["indicators"]["atr"].is_null());
    }

    #[test]
    fn test_command_parsing() {
        let stop: Command = serde_json::from_str(r#"{"action":"stop"}"#).unwrap();
        assert_eq!(stop, Command::Stop { close_position: true });

        let stop_keep: Command =
            serde_json::from_str(r#"{"action":"stop","close_position":false}"#).unwrap();
        assert_eq!(stop_keep, Command::Stop { close_position: false });

        let ping: Command = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(ping.action_name(), "ping");

        assert!(serde_json::from_str::<Command>(r#"{"action":"warp"}"#).is_err());
    }
}
