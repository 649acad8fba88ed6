use std::time::Duration;

use crate::config::PollConfig;

/// Capped exponential delay between state polls.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    factor: u32,
}

impl Backoff {
    pub fn new(config: &PollConfig) -> Self {
        let max = Duration::from_millis(config.max_ms.max(1));
        Self {
            current: Duration::from_millis(config.initial_ms.max(1)).min(max),
            max,
            factor: config.factor.max(1),
        }
    }

    /// The delay to sleep now; grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(self.factor).min(self.max);
        delay
    }
}
