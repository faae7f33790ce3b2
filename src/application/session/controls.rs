//! Pause/stop primitives for a session runtime.
//!
//! The pause gate is a watch channel holding "running" as a boolean: pausing
//! clears it and the driver blocks at the top of its next iteration; resume
//! sets it. Stop raises an atomic flag and also releases the gate so a
//! paused loop wakes up, observes the stop, and exits. The result channel
//! hands the finalizer's result id back to whoever requested the stop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;

pub struct SessionControls {
    gate: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
    close_position_on_stop: AtomicBool,
    result: watch::Sender<Option<String>>,
    /// Index the driver is currently processing, for pause/resume events and
    /// reconnect replay. Written only by the driver.
    current_index: AtomicUsize,
}

impl SessionControls {
    pub fn new() -> Self {
        Self {
            gate: watch::Sender::new(true),
            stopped: watch::Sender::new(false),
            close_position_on_stop: AtomicBool::new(true),
            result: watch::Sender::new(None),
            current_index: AtomicUsize::new(0),
        }
    }

    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    pub fn is_paused(&self) -> bool {
        !*self.gate.borrow() && !self.is_stopped()
    }

    /// Raises the stop flag and releases the pause gate.
    pub fn stop(&self, close_position: bool) {
        self.close_position_on_stop
            .store(close_position, Ordering::SeqCst);
        self.stopped.send_replace(true);
        self.gate.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves once the stop flag is raised. Lets long waits (countdowns,
    /// price-stream ticks) exit promptly instead of finishing their sleep.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        loop {
            if *stopped.borrow_and_update() {
                return;
            }
            if stopped.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn close_position_on_stop(&self) -> bool {
        self.close_position_on_stop.load(Ordering::SeqCst)
    }

    /// Blocks while paused. Returns immediately once running or stopped.
    pub async fn wait_if_paused(&self) {
        let mut gate = self.gate.subscribe();
        loop {
            if self.is_stopped() || *gate.borrow_and_update() {
                return;
            }
            if gate.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn set_current_index(&self, index: usize) {
        self.current_index.store(index, Ordering::SeqCst);
    }

    pub fn current_index(&self) -> usize {
        self.current_index.load(Ordering::SeqCst)
    }

    /// Called by the driver once finalization has produced a result id.
    pub fn publish_result(&self, result_id: &str) {
        self.result.send_replace(Some(result_id.to_string()));
    }

    /// Waits for the driver to publish the result id. Returns None if the
    /// driver vanished without finalizing.
    pub async fn wait_for_result(&self) -> Option<String> {
        let mut result = self.result.subscribe();
        loop {
            if let Some(id) = result.borrow_and_update().clone() {
                return Some(id);
            }
            if result.changed().await.is_err() {
                return result.borrow().clone();
            }
        }
    }
}

impl Default for SessionControls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_if_paused_passes_while_running() {
        let controls = SessionControls::new();
        // Must not block.
        tokio::time::timeout(Duration::from_millis(50), controls.wait_if_paused())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let controls = Arc::new(SessionControls::new());
        controls.pause();
        assert!(controls.is_paused());

        let waiter = {
            let controls = controls.clone();
            tokio::spawn(async move {
                controls.wait_if_paused().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        controls.resume();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_paused_waiter() {
        let controls = Arc::new(SessionControls::new());
        controls.pause();

        let waiter = {
            let controls = controls.clone();
            tokio::spawn(async move {
                controls.wait_if_paused().await;
                controls.is_stopped()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        controls.stop(true);

        let observed_stop = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(observed_stop);
    }

    #[tokio::test]
    async fn test_result_handoff() {
        let controls = Arc::new(SessionControls::new());
        let waiter = {
            let controls = controls.clone();
            tokio::spawn(async move { controls.wait_for_result().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        controls.publish_result("result-123");

        let id = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.as_deref(), Some("result-123"));

        // A second wait resolves immediately with the same id.
        assert_eq!(controls.wait_for_result().await.as_deref(), Some("result-123"));
    }
}
