use std::time::Duration;

/// Exponential retry delay: `base`, `2 * base`, `4 * base`, ... capped at
/// `max`. Cleared by the first fully successful cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: None,
        }
    }

    /// Register a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// The delay currently in force, if the last cycle failed.
    pub fn pending(&self) -> Option<Duration> {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
