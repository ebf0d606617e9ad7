use std::time::Duration;

use rand::Rng;

/// Capped doubling reconnect delay with additive jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `initial`, never exceeding `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt; doubles the base for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        jittered(base, self.max)
    }

    /// Back to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Add up to 20% of `base` so clients dropped together do not reconnect together.
fn jittered(base: Duration, max: Duration) -> Duration {
    let spread = u64::try_from(base.as_millis() / 5).unwrap_or(u64::MAX);
    if spread == 0 {
        return base;
    }
    let extra = rand::rng().random_range(0..=spread);
    (base + Duration::from_millis(extra)).min(max)
}
