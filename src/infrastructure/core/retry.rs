//! Attempt-level retry with exponential backoff, jitter, and rate-limit
//! reset hints.
//!
//! The market-data client uses blanket transient-retry middleware; the LLM
//! path cannot, because a 429 carries reset hints that must stretch the next
//! delay and a circuit-open rejection must not be retried at all.

use crate::domain::errors::LlmError;
use chrono::Utc;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Runs `operation` until it succeeds, the error is non-retryable, or the
/// attempt budget is spent. The backoff is exponential with 0.5-1.5x jitter;
/// a rate-limit error whose reset hint lies beyond the computed delay
/// stretches the sleep to at least that moment.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.is_retryable() || attempt + 1 == attempts {
                    return Err(error);
                }

                let mut delay = backoff_delay(policy, attempt);
                if let LlmError::RateLimited {
                    reset_at_ms: Some(reset_at_ms),
                } = &error
                {
                    let wait_ms = reset_at_ms - Utc::now().timestamp_millis();
                    if wait_ms > 0 {
                        delay = delay.max(Duration::from_millis(wait_ms as u64));
                    }
                }

                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    operation_name,
                    attempt + 1,
                    attempts,
                    error,
                    delay
                );
                last_error = Some(error);
                sleep(delay).await;
            }
        }
    }

    Err(last_error.unwrap_or(LlmError::Api("retry budget exhausted".to_string())))
}

fn backoff_delay(policy: RetryPolicy, attempt: usize) -> Duration {
    let exponential = policy.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::rng().random_range(0.5..1.5);
    let delay_ms = (exponential * jitter).min(policy.max_delay.as_millis() as f64);
    Duration::from_millis(delay_ms as u64)
}

/// Parses a rate-limit reset hint out of an error body or header dump.
///
/// Understands `X-RateLimit-Reset` (seconds or milliseconds since epoch,
/// auto-detected by magnitude) and `Retry-After` (seconds from now). Returns
/// milliseconds since epoch.
pub fn parse_rate_limit_reset(text: &str) -> Option<i64> {
    if let Some(raw) = digits_after(text, "x-ratelimit-reset") {
        // Values below ~year-2128 in seconds are treated as seconds.
        return Some(if raw < 5_000_000_000 { raw * 1000 } else { raw });
    }
    if let Some(seconds) = digits_after(text, "retry-after") {
        return Some(Utc::now().timestamp_millis() + seconds * 1000);
    }
    None
}

/// Finds `key` case-insensitively and parses the first run of digits that
/// follows within a few characters (skipping `: "` and whitespace).
fn digits_after(text: &str, key: &str) -> Option<i64> {
    let lower = text.to_lowercase();
    let start = lower.find(&key.to_lowercase())? + key.len();
    let rest = &lower[start..];

    let mut digits = String::new();
    for (offset, ch) in rest.char_indices() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        } else if offset > 8 {
            // Separator run too long; no number attached to this key.
            return None;
        }
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = retry_with_backoff(RetryPolicy::default(), "test", move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LlmError::Transport("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_returns_last_error() {
        let result: Result<(), _> =
            retry_with_backoff(RetryPolicy::default(), "test", || async {
                Err(LlmError::Transport("always down".into()))
            })
            .await;
        assert!(matches!(result, Err(LlmError::Transport(_))));
    }

    #[tokio::test]
    async fn test_circuit_open_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = retry_with_backoff(RetryPolicy::default(), "test", move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::CircuitOpen {
                    service: "openrouter".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(LlmError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_reset_header_seconds() {
        let reset = parse_rate_limit_reset("429: X-RateLimit-Reset: 1700000000").unwrap();
        assert_eq!(reset, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_reset_header_milliseconds() {
        let reset = parse_rate_limit_reset("x-ratelimit-reset\": \"1700000000123\"").unwrap();
        assert_eq!(reset, 1_700_000_000_123);
    }

    #[test]
    fn test_parse_retry_after_is_relative() {
        let before = Utc::now().timestamp_millis();
        let reset = parse_rate_limit_reset("Too Many Requests. Retry-After: 7").unwrap();
        assert!(reset >= before + 7000);
        assert!(reset <= before + 9000);
    }

    #[test]
    fn test_parse_no_hint() {
        assert_eq!(parse_rate_limit_reset("plain 429 body"), None);
    }
}
