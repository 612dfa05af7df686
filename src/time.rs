//! Monotonic microsecond timestamps for telemetry samples.

use std::time::{SystemTime, UNIX_EPOCH};

/// Produces strictly increasing microsecond timestamps even when the wall
/// clock jitters or two notifications land in the same tick: each call
/// returns `max(now, last + 1)`.
#[derive(Debug)]
pub struct MonotonicClock {
    last: u64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_micros() as u64
    }

    pub fn next(&mut self) -> u64 {
        let candidate = Self::now_micros();
        let t = candidate.max(self.last + 1);
        self.last = t;
        t
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing_across_many_calls() {
        let mut clock = MonotonicClock::new();
        let mut last = clock.next();
        for _ in 0..1000 {
            let t = clock.next();
            assert!(t > last);
            last = t;
        }
    }
}
