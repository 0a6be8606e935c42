use std::fmt;
use std::time::Duration;

use log::info;
use tokio::time::Instant;

/// Bulbs accept roughly one command per second per connection.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Quiet period after which burst mode falls back to normal pacing.
pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    Normal,
    Burst,
}

impl fmt::Display for RateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateMode::Normal => write!(f, "normal"),
            RateMode::Burst => write!(f, "burst"),
        }
    }
}

/// Per-connection send pacing.
///
/// In [`RateMode::Normal`] two sends are never closer than `min_interval`.
/// [`RateMode::Burst`] lifts that restriction until `burst_window` has passed
/// without any send.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    burst_window: Duration,
    last_send: Option<Instant>,
    mode: RateMode,
    burst_deadline: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, burst_window: Duration) -> Self {
        RateLimiter {
            min_interval,
            burst_window,
            last_send: None,
            mode: RateMode::Normal,
            burst_deadline: None,
        }
    }

    /// Current mode, after applying any expired burst deadline.
    pub fn mode(&mut self, now: Instant) -> RateMode {
        self.expire(now);
        self.mode
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn burst_deadline(&self) -> Option<Instant> {
        self.burst_deadline
    }

    pub fn enter_burst(&mut self, now: Instant) {
        if self.mode == RateMode::Normal {
            info!("Queue overflow, switching to burst mode");
        }
        self.mode = RateMode::Burst;
        self.burst_deadline = Some(now + self.burst_window);
    }

    /// Falls back to normal pacing once the burst window has elapsed.
    /// Returns true if this call performed the transition.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.burst_deadline {
            Some(deadline) if self.mode == RateMode::Burst && now >= deadline => {
                self.mode = RateMode::Normal;
                self.burst_deadline = None;
                info!("No sends for {:?}, back to normal pacing", self.burst_window);
                true
            }
            _ => false,
        }
    }

    /// Earliest instant at which the next send is allowed.
    pub fn next_permitted(&mut self, now: Instant) -> Instant {
        if self.mode(now) == RateMode::Burst {
            return now;
        }
        match self.last_send {
            Some(last) if last + self.min_interval > now => last + self.min_interval,
            _ => now,
        }
    }

    pub fn record_send(&mut self, now: Instant) {
        self.last_send = Some(now);
        if self.mode == RateMode::Burst {
            self.burst_deadline = Some(now + self.burst_window);
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(DEFAULT_MIN_INTERVAL, DEFAULT_BURST_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_mode_spaces_sends() {
        let start = Instant::now();
        let mut limiter = RateLimiter::default();
        assert_eq!(limiter.next_permitted(start), start);
        limiter.record_send(start);
        let half = start + Duration::from_millis(500);
        assert_eq!(limiter.next_permitted(half), start + DEFAULT_MIN_INTERVAL);
        let later = start + Duration::from_millis(1500);
        assert_eq!(limiter.next_permitted(later), later);
    }

    #[test]
    fn test_burst_reverts_after_quiet_window() {
        let start = Instant::now();
        let mut limiter = RateLimiter::default();
        limiter.enter_burst(start);
        limiter.record_send(start + Duration::from_secs(3));
        // The window restarts at the last send.
        assert_eq!(
            limiter.mode(start + Duration::from_secs(6)),
            RateMode::Burst
        );
        assert_eq!(
            limiter.mode(start + Duration::from_secs(8)),
            RateMode::Normal
        );
        assert_eq!(limiter.burst_deadline(), None);
    }

    #[test]
    fn test_burst_ignores_min_interval() {
        let start = Instant::now();
        let mut limiter = RateLimiter::default();
        limiter.enter_burst(start);
        limiter.record_send(start);
        let soon = start + Duration::from_millis(10);
        assert_eq!(limiter.next_permitted(soon), soon);
    }
}
