//! Exponential backoff with jitter, shared by the connection handler and the
//! lookup service's retry loop.

use std::time::Duration;

use rand::Rng;

/// `next()` doubles the previous delay (capped at `max`) and adds up to 10%
/// jitter so that many handlers reconnecting at once don't thunder the herd.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    multiplier: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            current: initial,
            multiplier: 2,
        }
    }

    /// The delay to wait before the next attempt; advances internal state.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        let doubled = self.current * self.multiplier;
        self.current = if doubled > self.max { self.max } else { doubled };

        let jitter_pct: f64 = rand::thread_rng().gen_range(0.0..0.1);
        let jittered = delay.as_secs_f64() * (1.0 + jitter_pct);
        Duration::from_secs_f64(jittered)
    }

    /// Reset after a successful connection, so the next failure starts cold.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let d1 = backoff.next();
        let d2 = backoff.next();
        let d3 = backoff.next();
        assert!(d1.as_millis() >= 100 && d1.as_millis() < 111);
        assert!(d2.as_millis() >= 200 && d2.as_millis() < 221);
        // third call would double to 400ms but is capped at 350ms (+jitter)
        assert!(d3.as_millis() >= 350 && d3.as_millis() < 386);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(10));
        backoff.next();
        backoff.next();
        backoff.reset();
        let after_reset = backoff.next();
        assert!(after_reset.as_millis() >= 50 && after_reset.as_millis() < 56);
    }
}
