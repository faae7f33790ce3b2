//! Forward session scenarios: warm-up streaming with indicators, the seed
//! analysis on the last warm-up candle, countdown emission, and manual stop.

mod common;

use candlemind::application::forward::{AutoStopPolicy, ForwardEngine, ForwardRequest};
use candlemind::application::session::DecisionCadence;
use candlemind::domain::agent::AgentMode;
use candlemind::domain::events::{Event, EventKind};
use candlemind::domain::market::Timeframe;
use candlemind::infrastructure::credentials::PassthroughCipher;
use candlemind::infrastructure::event_bus::EventBus;
use candlemind::infrastructure::mock::{
    ScriptedDecisionProvider, ScriptedProviderFactory, SyntheticMarketData, flat_series,
};
use candlemind::infrastructure::persistence::Repositories;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("bus closed")
}

#[tokio::test]
async fn forward_streams_warmup_seeds_analysis_and_stops_cleanly() {
    let provider = Arc::new(ScriptedDecisionProvider::always_hold());
    let db = common::temp_database().await;
    let repos = Repositories::sqlite(&db);
    let bus = EventBus::new();
    let gateway = Arc::new(SyntheticMarketData::new());
    let engine = Arc::new(ForwardEngine::new(
        repos.clone(),
        bus.clone(),
        gateway.clone(),
        Arc::new(PassthroughCipher),
        Arc::new(ScriptedProviderFactory::new(provider.clone())),
    ));

    let agent_id = common::seed_agent(&repos, "fwd-agent", AgentMode::Omni, &[], vec![]).await;

    // 30 warm-up candles ending just before now.
    let warmup_start = Utc::now() - ChronoDuration::minutes(15 * 30);
    gateway
        .set_historical(
            "BTC/USDT",
            Timeframe::FifteenMin,
            flat_series(30, 100.0, warmup_start, Timeframe::FifteenMin),
        )
        .await;

    let (_conn, mut rx) = bus.connect("fwd-1").await;
    engine
        .start(ForwardRequest {
            session_id: "fwd-1".to_string(),
            agent_id,
            asset: "BTC/USDT".to_string(),
            timeframe: Timeframe::FifteenMin,
            starting_capital: 10_000.0,
            safety_mode: true,
            allow_leverage: false,
            cadence: DecisionCadence::EveryCandle,
            auto_stop: AutoStopPolicy::default(),
            council: None,
        })
        .await
        .unwrap();

    // Drain events until the driver has seeded the opening analysis and
    // entered the candle-close wait (signalled by a countdown update).
    let mut events: Vec<Event> = Vec::new();
    loop {
        let event = next_event(&mut rx).await;
        let is_countdown = matches!(event.kind, EventKind::CountdownUpdate { .. });
        events.push(event);
        if is_countdown {
            break;
        }
    }

    // Warm-up candles arrived with the last one numbered 0.
    let numbers: Vec<i64> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Candle { candle_number, .. } => Some(*candle_number),
            _ => None,
        })
        .collect();
    assert_eq!(numbers.len(), 30);
    assert_eq!(*numbers.first().unwrap(), -29);
    assert_eq!(*numbers.last().unwrap(), 0);

    // The seed decision ran on the last warm-up candle.
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::AiDecision { candle_number: 0, .. }
    )));
    assert!(provider.call_count() >= 1);
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::IndicatorReadiness { .. }
    )));

    // Manual stop interrupts the candle-close wait promptly.
    let result_id = tokio::time::timeout(Duration::from_secs(10), engine.stop("fwd-1", true))
        .await
        .expect("stop timed out")
        .unwrap();
    assert!(!result_id.is_empty());

    loop {
        let event = next_event(&mut rx).await;
        if let EventKind::SessionCompleted {
            result_id: completed_id,
            forced_stop,
            auto_stop,
            ..
        } = &event.kind
        {
            assert_eq!(completed_id, &result_id);
            assert!(*forced_stop);
            assert!(!*auto_stop);
            break;
        }
    }

    // Result row persisted with a null equity curve only on DB-rebuild
    // paths; a live stop keeps the sampled curve.
    let result = repos
        .results
        .latest_for_session("fwd-1")
        .await
        .unwrap()
        .expect("result persisted");
    assert!(result.forced_stop);
    assert!(result.equity_curve.is_some());
}
