//! Resilience-stack scenarios against a canned-response HTTP server:
//! rate-limit backoff with Retry-After hints, circuit-breaker degradation,
//! and the process-wide request-start throttle.

mod common;

use candlemind::domain::agent::AgentMode;
use candlemind::domain::decision::DecisionAction;
use candlemind::domain::market::Candle;
use candlemind::domain::ports::{DecisionProvider, DecisionRequest};
use candlemind::infrastructure::core::retry::RetryPolicy;
use candlemind::infrastructure::openrouter::{LlmSettings, OpenRouterTrader};
use chrono::Utc;
use common::{StubResponse, spawn_stub_server};
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn settings(base_url: String) -> LlmSettings {
    LlmSettings {
        base_url,
        http_referer: "http://localhost:3000".to_string(),
        x_title: "candlemind-tests".to_string(),
        request_min_interval: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        },
        breaker_failure_threshold: 5,
        breaker_reset_timeout: Duration::from_secs(60),
        council_model_timeout: Duration::from_secs(5),
    }
}

fn sample_request() -> DecisionRequest {
    DecisionRequest {
        candle: Candle::new(Utc::now(), 100.0, 101.0, 99.0, 100.5, 10.0).unwrap(),
        indicators: Default::default(),
        position: None,
        equity: 10_000.0,
        recent_candles: vec![],
        recent_indicators: vec![],
        context: json!({"allow_leverage": false, "max_leverage": 1}),
    }
}

#[tokio::test]
async fn rate_limited_attempts_honor_retry_after_hint() {
    let completion_starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let starts_clone = completion_starts.clone();
    let calls_clone = calls.clone();
    let base_url = spawn_stub_server(move |request| {
        if request.path.ends_with("/models") {
            return StubResponse::json(json!({"data": []}));
        }
        starts_clone.lock().unwrap().push(Instant::now());
        let call = calls_clone.fetch_add(1, Ordering::SeqCst);
        if call < 2 {
            // First two attempts are rejected with an explicit reset hint.
            StubResponse::rate_limited(1)
        } else {
            StubResponse::completion(
                r#"{"action":"SHORT","reasoning":"overbought","size_percentage":0.25,"leverage":1}"#,
            )
        }
    })
    .await;

    let trader = OpenRouterTrader::new(
        "sk-or-test".to_string(),
        "test/model-1".to_string(),
        "strategy".to_string(),
        AgentMode::Omni,
        settings(base_url),
    );

    let decision = trader.decide(sample_request()).await;
    assert_eq!(decision.action, DecisionAction::Short);
    assert_eq!(calls.load(Ordering::SeqCst), 3, "attempt count within budget");

    let starts = completion_starts.lock().unwrap();
    // The attempt after the second 429 must start no sooner than the
    // Retry-After hint (1 second).
    let gap = starts[2].duration_since(starts[1]);
    assert!(
        gap >= Duration::from_millis(950),
        "retry started after only {:?}",
        gap
    );
}

#[tokio::test]
async fn repeated_failures_open_the_circuit_and_degrade_to_hold() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let base_url = spawn_stub_server(move |request| {
        if request.path.ends_with("/models") {
            return StubResponse::json(json!({"data": []}));
        }
        calls_clone.fetch_add(1, Ordering::SeqCst);
        StubResponse {
            status: 500,
            headers: vec![],
            body: r#"{"error":"exploded"}"#.to_string(),
        }
    })
    .await;

    let trader = OpenRouterTrader::new(
        "sk-or-test".to_string(),
        "test/model-1".to_string(),
        "strategy".to_string(),
        AgentMode::Omni,
        settings(base_url),
    );

    // First decide burns the full retry budget (3 failures).
    let first = trader.decide(sample_request()).await;
    assert_eq!(first.action, DecisionAction::Hold);
    assert!(first.reasoning.contains("Failed to get AI decision"));

    // Second decide pushes the consecutive-failure count to the threshold;
    // the breaker opens mid-way and the decide resolves to the circuit-open
    // HOLD contract.
    let second = trader.decide(sample_request()).await;
    assert_eq!(second.action, DecisionAction::Hold);
    assert!(
        second.reasoning.contains("temporarily unavailable"),
        "unexpected reasoning: {}",
        second.reasoning
    );

    // Threshold is 5: no request ever went out after the breaker opened.
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn consecutive_request_starts_respect_the_global_throttle() {
    let completion_starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let starts_clone = completion_starts.clone();
    let base_url = spawn_stub_server(move |request| {
        if request.path.ends_with("/models") {
            return StubResponse::json(json!({"data": []}));
        }
        starts_clone.lock().unwrap().push(Instant::now());
        StubResponse::completion(
            r#"{"action":"HOLD","reasoning":"flat","size_percentage":0,"leverage":1}"#,
        )
    })
    .await;

    let mut throttled = settings(base_url);
    throttled.request_min_interval = Duration::from_millis(300);
    let trader = OpenRouterTrader::new(
        "sk-or-test".to_string(),
        "test/model-1".to_string(),
        "strategy".to_string(),
        AgentMode::Omni,
        throttled,
    );

    for _ in 0..3 {
        let decision = trader.decide(sample_request()).await;
        assert_eq!(decision.action, DecisionAction::Hold);
    }

    let starts = completion_starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(280),
            "request starts only {:?} apart",
            gap
        );
    }
}
