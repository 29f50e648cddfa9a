#![forbid(unsafe_code)]

// Per-connection command limiter over a rolling window

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Default: 10 commands per rolling second.
pub const DEFAULT_MAX_COMMANDS: u32 = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Admits at most `max` commands within any `window`-long span.
/// Rejected commands are not recorded, so a flood does not extend its own penalty.
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    accepted: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            accepted: VecDeque::with_capacity(max as usize),
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.accepted.front() {
            if now.duration_since(oldest) >= self.window {
                self.accepted.pop_front();
            } else {
                break;
            }
        }

        if self.accepted.len() < self.max as usize {
            self.accepted.push_back(now);
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMANDS, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_limit() {
        let mut limiter = RateLimiter::default();
        let t0 = Instant::now();
        for i in 0..10 {
            assert!(limiter.check_at(t0 + Duration::from_millis(i * 10)), "command {i}");
        }
        assert!(!limiter.check_at(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_window_rolls() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(limiter.check_at(t0));
        assert!(limiter.check_at(t0 + Duration::from_millis(600)));
        assert!(!limiter.check_at(t0 + Duration::from_millis(900)));
        // First one ages out at t0 + 1s
        assert!(limiter.check_at(t0 + Duration::from_millis(1_000)));
        assert!(!limiter.check_at(t0 + Duration::from_millis(1_500)));
        assert!(limiter.check_at(t0 + Duration::from_millis(1_600)));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(limiter.check_at(t0));
        for i in 1..20 {
            assert!(!limiter.check_at(t0 + Duration::from_millis(i * 40)));
        }
        assert!(limiter.check_at(t0 + Duration::from_millis(1_000)));
    }
}
