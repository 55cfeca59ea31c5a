use std::collections::HashSet;
use std::time::Duration;

use super::types::View;
use crate::network::Action;

/// Every timer a node can arm. Keys are scoped so that a timer left over
/// from a view the node has moved past is recognisably stale.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TimerKey {
    /// A request is waiting for a pre-prepare in `view`.
    Request { view: View },
    /// The view change to `view` has not produced a new view yet.
    ViewChange { view: View },
    /// The client has had no quorum of replies for `timestamp`.
    ClientRetry { timestamp: u64 },
}

/// Doubling timeout with a capped exponent.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max_exponent: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_exponent: u32) -> Self {
        Backoff {
            base,
            max_exponent,
            attempts: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.base * 2u32.saturating_pow(self.attempts.min(self.max_exponent))
    }

    /// Returns the current timeout and doubles the next one.
    pub fn next(&mut self) -> Duration {
        let current = self.current();
        self.attempts = self.attempts.saturating_add(1);
        current
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Which timers are armed, so a firing that raced a cancellation is ignored.
#[derive(Debug, Default)]
pub struct Timers {
    armed: HashSet<TimerKey>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, key: TimerKey, after: Duration) -> Action {
        self.armed.insert(key);
        Action::SetTimer { key, after }
    }

    pub fn cancel(&mut self, key: TimerKey) -> Option<Action> {
        self.armed.remove(&key).then_some(Action::CancelTimer { key })
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains(key)
    }

    /// Consumes a firing. False if the timer was cancelled meanwhile.
    pub fn fired(&mut self, key: &TimerKey) -> bool {
        self.armed.remove(key)
    }

    /// Cancels every armed timer matching `pred`.
    pub fn cancel_where(&mut self, pred: impl Fn(&TimerKey) -> bool) -> Vec<Action> {
        let keys: Vec<TimerKey> = self.armed.iter().filter(|k| pred(k)).copied().collect();
        keys.into_iter().filter_map(|key| self.cancel(key)).collect()
    }
}
