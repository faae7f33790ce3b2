//! Shared fixtures for the integration tests: a throwaway SQLite database,
//! agent seeding, and a minimal canned-response HTTP server for exercising
//! the OpenRouter transport without the network.

#![allow(dead_code)]

use candlemind::domain::agent::{AgentConfig, AgentMode, ApiKeyRecord};
use candlemind::infrastructure::persistence::{Database, Repositories};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

/// Fresh file-backed database under the OS temp dir; WAL mode needs a real
/// file and in-memory SQLite is per-connection.
pub async fn temp_database() -> Database {
    let path = std::env::temp_dir().join(format!("candlemind-test-{}.db", Uuid::new_v4()));
    Database::new(&format!("sqlite://{}", path.display()))
        .await
        .expect("temp database")
}

/// Inserts an agent plus its API key and returns the agent id.
pub async fn seed_agent(
    repos: &Repositories,
    name: &str,
    mode: AgentMode,
    indicators: &[&str],
    custom_indicators: Vec<Value>,
) -> Uuid {
    let key = ApiKeyRecord {
        id: Uuid::new_v4(),
        encrypted_key: "sk-or-test-key".to_string(),
        key_prefix: "sk-or-te".to_string(),
    };
    repos.api_keys.save(&key).await.expect("save api key");

    let agent = AgentConfig {
        id: Uuid::new_v4(),
        name: name.to_string(),
        mode,
        model: "test/model-1".to_string(),
        strategy_prompt: "Trade the trend.".to_string(),
        indicators: indicators.iter().map(|s| s.to_string()).collect(),
        custom_indicators,
        api_key_id: Some(key.id),
    };
    repos.agents.save(&agent).await.expect("save agent");
    agent.id
}

/// Request seen by the stub server: method path + parsed JSON body.
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub path: String,
    pub body: Value,
}

/// Response the handler wants sent back.
#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StubResponse {
    pub fn json(body: Value) -> Self {
        Self {
            status: 200,
            headers: vec![],
            body: body.to_string(),
        }
    }

    pub fn completion(content: &str) -> Self {
        Self::json(serde_json::json!({
            "choices": [{"message": {"content": content}, "finish_reason": "stop"}]
        }))
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            status: 429,
            headers: vec![("Retry-After".to_string(), retry_after_secs.to_string())],
            body: r#"{"error":"too many requests"}"#.to_string(),
        }
    }
}

/// Tiny HTTP/1.1 responder good enough for reqwest: reads one request per
/// connection, hands it to the handler, writes the response, closes.
pub async fn spawn_stub_server<F>(handler: F) -> String
where
    F: Fn(StubRequest) -> StubResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 4096];

                // Read headers.
                let header_end = loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = find_subsequence(&buffer, b"\r\n\r\n") {
                        break pos + 4;
                    }
                    if buffer.len() > 1 << 20 {
                        return;
                    }
                };

                let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
                let path = head
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                let content_length: usize = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.trim()
                            .eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse().ok())?
                    })
                    .unwrap_or(0);

                // Read the remainder of the body.
                while buffer.len() < header_end + content_length {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                }
                let body: Value =
                    serde_json::from_slice(&buffer[header_end..]).unwrap_or(Value::Null);

                let response = handler(StubRequest { path, body });
                let mut head = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                    response.status,
                    response.body.len()
                );
                for (name, value) in &response.headers {
                    head.push_str(&format!("{name}: {value}\r\n"));
                }
                head.push_str("\r\n");
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(response.body.as_bytes()).await;
                let _ = socket.flush().await;
            });
        }
    });

    format!("http://{addr}")
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
