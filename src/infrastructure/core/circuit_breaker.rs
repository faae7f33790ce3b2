use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,   // Normal operation - requests pass through
    Open,     // Failure threshold breached - reject all requests
    HalfOpen, // Testing if service recovered - a single probe is in flight
}

/// Circuit breaker protecting a remote service.
///
/// Closed until `failure_threshold` consecutive failures, then open for
/// `reset_timeout`. After the timeout one probe request is admitted; success
/// closes the breaker, failure re-opens it.
pub struct CircuitBreaker {
    state: Arc<RwLock<BreakerState>>,
    failure_threshold: usize,
    reset_timeout: Duration,
    name: String,
}

struct BreakerState {
    state: CircuitState,
    failure_count: usize,
    probe_in_flight: bool,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: usize, reset_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                probe_in_flight: false,
                last_failure_time: None,
            })),
            failure_threshold,
            reset_timeout,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute a call under breaker protection.
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut state = self.state.write().await;
            match state.state {
                CircuitState::Open => {
                    let elapsed = state
                        .last_failure_time
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed > self.reset_timeout {
                        info!(
                            "CircuitBreaker [{}]: Transitioning Open -> HalfOpen (timeout elapsed)",
                            self.name
                        );
                        state.state = CircuitState::HalfOpen;
                        state.probe_in_flight = true;
                    } else {
                        return Err(CircuitBreakerError::Open(format!(
                            "Circuit breaker [{}] is open. Retry in {:?}",
                            self.name,
                            self.reset_timeout.saturating_sub(elapsed)
                        )));
                    }
                }
                CircuitState::HalfOpen => {
                    // Only one probe at a time while half-open.
                    if state.probe_in_flight {
                        return Err(CircuitBreakerError::Open(format!(
                            "Circuit breaker [{}] is half-open with a probe in flight",
                            self.name
                        )));
                    }
                    state.probe_in_flight = true;
                }
                CircuitState::Closed => {}
            }
        }

        match f.await {
            Ok(result) => {
                self.on_success().await;
                Ok(result)
            }
            Err(e) => {
                self.on_failure().await;
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::HalfOpen => {
                info!(
                    "CircuitBreaker [{}]: Transitioning HalfOpen -> Closed (probe succeeded)",
                    self.name
                );
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.probe_in_flight = false;
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {
                warn!(
                    "CircuitBreaker [{}]: Success recorded in Open state (unexpected)",
                    self.name
                );
            }
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.failure_threshold {
                    warn!(
                        "CircuitBreaker [{}]: Transitioning Closed -> Open ({} consecutive failures)",
                        self.name, state.failure_count
                    );
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "CircuitBreaker [{}]: Transitioning HalfOpen -> Open (probe failed)",
                    self.name
                );
                state.state = CircuitState::Open;
                state.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }
}

/// Error type for circuit breaker
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open: {0}")]
    Open(String),

    #[error(transparent)]
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(1));

        for _ in 0..3 {
            let result = cb.call(async { Err::<(), &str>("error") }).await;
            assert!(result.is_err());
        }

        assert_eq!(cb.state().await, CircuitState::Open);

        // Next call is rejected without executing.
        let result = cb.call(async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open(_))));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(1));

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), &str>("error") }).await;
        }
        let _ = cb.call(async { Ok::<(), &str>(()) }).await;
        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), &str>("error") }).await;
        }

        // Two failures after the reset: still closed.
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_success_closes_circuit() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_millis(50));

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), &str>("error") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(async { Ok::<(), &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_circuit() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_millis(50));

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), &str>("error") }).await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = cb.call(async { Err::<(), &str>("error") }).await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
