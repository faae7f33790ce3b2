//! Council happy path against the canned-response server: three members
//! produce distinct decisions, rankings agree B > A > C, and the chairman
//! synthesizes a LONG.

mod common;

use candlemind::domain::agent::AgentMode;
use candlemind::domain::decision::DecisionAction;
use candlemind::domain::market::Candle;
use candlemind::domain::ports::{DecisionProvider, DecisionRequest};
use candlemind::infrastructure::core::retry::RetryPolicy;
use candlemind::infrastructure::openrouter::{CouncilTrader, LlmSettings};
use chrono::Utc;
use common::{StubResponse, spawn_stub_server};
use serde_json::json;
use std::time::Duration;

fn settings(base_url: String) -> LlmSettings {
    LlmSettings {
        base_url,
        http_referer: "http://localhost:3000".to_string(),
        x_title: "candlemind-tests".to_string(),
        request_min_interval: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
        retry: RetryPolicy::default(),
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
async fn council_three_stages_produce_synthesized_decision() {
    let base_url = spawn_stub_server(|request| {
        let model = request.body["model"].as_str().unwrap_or_default().to_string();
        let prompt = request.body["messages"][0]["content"]
            .as_str()
            .unwrap_or_default();

        if prompt.contains("You are the Chairman") {
            return StubResponse::completion(
                r#"{"action":"LONG","reasoning":"council consensus is bullish","size_percentage":0.3,"leverage":1}"#,
            );
        }
        if prompt.contains("You are evaluating different trading decisions") {
            // Every voter agrees: B > A > C.
            return StubResponse::completion(
                "Decision A is aggressive. Decision B is balanced. Decision C ignores risk.\n\n\
                 FINAL RANKING:\n1. Decision B\n2. Decision A\n3. Decision C\n",
            );
        }
        // Stage 1: distinct decision per model.
        let content = match model.as_str() {
            "test/model-1" => r#"{"action":"LONG","reasoning":"breakout","size_percentage":0.5,"leverage":1}"#,
            "test/model-2" => r#"{"action":"HOLD","reasoning":"wait for confirmation","size_percentage":0.0,"leverage":1}"#,
            _ => r#"{"action":"SHORT","reasoning":"fade the move","size_percentage":0.2,"leverage":1}"#,
        };
        StubResponse::completion(content)
    })
    .await;

    let council = CouncilTrader::new(
        "sk-or-test".to_string(),
        vec![
            "test/model-1".to_string(),
            "test/model-2".to_string(),
            "test/model-3".to_string(),
        ],
        "test/chairman".to_string(),
        "Trade the trend.".to_string(),
        AgentMode::Omni,
        settings(base_url),
    );

    let decision = council.decide(sample_request()).await;

    assert_eq!(decision.action, DecisionAction::Long);
    assert!(decision.reasoning.contains("council consensus"));

    let deliberation = decision
        .context
        .as_ref()
        .and_then(|c| c.get("council_deliberation"))
        .expect("council deliberation metadata");

    // Fresh anonymized label map of size 3.
    let label_map = deliberation["label_to_model"]
        .as_object()
        .expect("label map");
    assert_eq!(label_map.len(), 3);
    assert_eq!(label_map["Decision A"], "test/model-1");
    assert_eq!(label_map["Decision B"], "test/model-2");
    assert_eq!(label_map["Decision C"], "test/model-3");

    assert_eq!(deliberation["stage1"].as_array().unwrap().len(), 3);
    assert_eq!(deliberation["stage2"].as_array().unwrap().len(), 3);
    assert_eq!(deliberation["stage3"]["model"], "test/chairman");

    // Borda aggregate ordered best-first: B, A, C.
    let aggregate = deliberation["aggregate_rankings"].as_array().unwrap();
    assert_eq!(aggregate.len(), 3);
    assert_eq!(aggregate[0]["model"], "test/model-2");
    assert_eq!(aggregate[0]["average_rank"], 1.0);
    assert_eq!(aggregate[1]["model"], "test/model-1");
    assert_eq!(aggregate[2]["model"], "test/model-3");

    // Parsed rankings survived into the transcript.
    let parsed = deliberation["stage2"][0]["parsed_ranking"].as_array().unwrap();
    assert_eq!(parsed[0], "Decision B");
    assert_eq!(parsed[1], "Decision A");
    assert_eq!(parsed[2], "Decision C");
}

#[tokio::test]
async fn council_with_no_responses_degrades_to_rate_limited_hold() {
    let base_url = spawn_stub_server(|_request| StubResponse::rate_limited(1)).await;

    let council = CouncilTrader::new(
        "sk-or-test".to_string(),
        vec!["cheap/model-a".to_string()],
        "cheap/chair".to_string(),
        "Trade the trend.".to_string(),
        AgentMode::Omni,
        settings(base_url),
    );

    let decision = council.decide(sample_request()).await;
    assert_eq!(decision.action, DecisionAction::Hold);
    assert!(decision.reasoning.contains("rate limited"));

    let deliberation = decision
        .context
        .as_ref()
        .and_then(|c| c.get("council_deliberation"))
        .expect("metadata present even on failure");
    assert_eq!(deliberation["rate_limited"], json!(true));
    assert_eq!(deliberation["stage1"].as_array().unwrap().len(), 0);
}
