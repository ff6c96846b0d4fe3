//! Timer management for the node runtime.
//!
//! Timers are tokio tasks that sleep and then push their id onto the node's
//! event channel. Setting a timer with an id that is already armed replaces
//! it.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Identifies a node timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Dev-consensus seal tick.
    DevSeal,
}

/// Manages node timers.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<TimerId>,
}

impl TimerManager {
    /// New manager pushing fired timer ids into `event_tx`.
    pub fn new(event_tx: mpsc::Sender<TimerId>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm a timer, replacing any armed timer with the same id.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "timer fired");
            let _ = event_tx.send(id).await;
        });

        self.timers.insert(id, handle);
        debug!(?id, ?duration, "timer set");
    }

    /// Cancel a timer. A no-op if it does not exist or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }

    /// Cancel everything; called on shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "timer cancelled at shutdown");
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::DevSeal, Duration::from_millis(10));

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timer never fired")
            .expect("channel closed");
        assert_eq!(fired, TimerId::DevSeal);
    }

    #[tokio::test]
    async fn cancelled_timer_stays_silent() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::DevSeal, Duration::from_millis(20));
        timers.cancel_timer(TimerId::DevSeal);

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "cancelled timer fired");
    }

    #[tokio::test]
    async fn rearming_replaces_the_pending_timer() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::DevSeal, Duration::from_secs(60));
        timers.set_timer(TimerId::DevSeal, Duration::from_millis(10));

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("replacement timer never fired");
        assert_eq!(fired, Some(TimerId::DevSeal));
    }
}
