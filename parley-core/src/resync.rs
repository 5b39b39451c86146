//! Per-entity rate limiter for forced resyncs.
//!
//! Bursts of events that all reference the same unknown session collapse to
//! one fetch per window.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ResyncLimiter {
    window: Duration,
    last_fired: HashMap<String, Instant>,
}

impl ResyncLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: HashMap::new(),
        }
    }

    /// `true` if a resync for `key` may fire at `now`; records the firing.
    pub fn try_acquire(&mut self, key: &str, now: Instant) -> bool {
        match self.last_fired.get(key) {
            Some(last) if now.saturating_duration_since(*last) < self.window => false,
            _ => {
                self.last_fired.insert(key.to_string(), now);
                true
            }
        }
    }

    /// The entity showed up; the next miss may resync immediately.
    pub fn forget(&mut self, key: &str) {
        self.last_fired.remove(key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.last_fired
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.last_fired.len()
    }
}
