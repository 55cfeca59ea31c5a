//! Tokio timers for the node driver.
//!
//! Each armed timer is a task that sleeps and then feeds `Event::Timer` back
//! into the node's own event channel.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Event;
use crate::consensus::timer::TimerKey;

pub struct TimerManager {
    timers: HashMap<TimerKey, JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arms `key`, replacing any timer already armed under it.
    pub fn set_timer(&mut self, key: TimerKey, after: Duration) {
        self.cancel_timer(key);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trace!(?key, "timer fired");
            // the node may already be shutting down
            let _ = event_tx.send(Event::Timer(key)).await;
        });

        self.timers.insert(key, handle);
        debug!(?key, ?after, "timer set");
    }

    /// No-op if the timer does not exist or already fired.
    pub fn cancel_timer(&mut self, key: TimerKey) {
        if let Some(handle) = self.timers.remove(&key) {
            handle.abort();
            debug!(?key, "timer cancelled");
        }
    }

    pub fn cancel_all(&mut self) {
        for (key, handle) in self.timers.drain() {
            handle.abort();
            trace!(?key, "timer cancelled (shutdown)");
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
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

    const KEY: TimerKey = TimerKey::Request { view: 0 };

    #[tokio::test]
    async fn test_timer_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);
        manager.set_timer(KEY, Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(500), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::Timer(TimerKey::Request { view: 0 })));
    }

    #[tokio::test]
    async fn test_timer_cancel() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);
        manager.set_timer(KEY, Duration::from_millis(50));
        manager.cancel_timer(KEY);

        let result = tokio::time::timeout(Duration::from_millis(150), event_rx.recv()).await;
        assert!(result.is_err(), "timer should have been cancelled");
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_timer_replace() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);
        manager.set_timer(KEY, Duration::from_secs(5));
        manager.set_timer(KEY, Duration::from_millis(10));
        assert_eq!(manager.active_count(), 1);

        let event = tokio::time::timeout(Duration::from_millis(500), event_rx.recv())
            .await
            .expect("timeout - replaced timer did not fire")
            .expect("channel closed");
        assert!(matches!(event, Event::Timer(_)));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);
        manager.set_timer(KEY, Duration::from_millis(50));
        manager.set_timer(TimerKey::ViewChange { view: 1 }, Duration::from_millis(50));
        assert_eq!(manager.active_count(), 2);

        manager.cancel_all();
        assert_eq!(manager.active_count(), 0);
        let result = tokio::time::timeout(Duration::from_millis(150), event_rx.recv()).await;
        assert!(result.is_err(), "no timers should have fired");
    }
}
