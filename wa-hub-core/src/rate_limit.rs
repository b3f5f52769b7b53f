//! Per-instance rolling-window send rate limiter.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::rolling_window::RollingWindow;

/// Outcome of a rate-limit check against both the minute and hour windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    /// The send must wait until `retry_at` — the minute OR hour window edge,
    /// whichever is later. The two windows are checked independently; if
    /// either trips, the item is deferred.
    Deferred { retry_at_millis_from_now: u64 },
}

/// Independent minute/hour rolling counters for one instance's successful
/// sends. Per-instance, so this lives inside `InstanceContext` rather than
/// as a shared singleton.
pub struct RateLimiter {
    per_minute_limit: u32,
    per_hour_limit: u32,
    minute: Mutex<RollingWindow>,
    hour: Mutex<RollingWindow>,
}

impl RateLimiter {
    pub fn new(per_minute_limit: u32, per_hour_limit: u32) -> Self {
        Self {
            per_minute_limit,
            per_hour_limit,
            minute: Mutex::new(RollingWindow::new(Duration::from_secs(60))),
            hour: Mutex::new(RollingWindow::new(Duration::from_secs(3600))),
        }
    }

    /// Check whether a send is allowed right now, without recording one.
    pub fn check(&self, now: Instant) -> RateLimitDecision {
        let minute_count = self.minute.lock().count(now);
        let hour_count = self.hour.lock().count(now);

        let minute_tripped = minute_count as u32 >= self.per_minute_limit;
        let hour_tripped = hour_count as u32 >= self.per_hour_limit;

        if !minute_tripped && !hour_tripped {
            return RateLimitDecision::Allowed;
        }

        let minute_edge = if minute_tripped {
            self.minute.lock().next_free_at(now)
        } else {
            None
        };
        let hour_edge = if hour_tripped {
            self.hour.lock().next_free_at(now)
        } else {
            None
        };

        let retry_at = match (minute_edge, hour_edge) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => now,
        };

        RateLimitDecision::Deferred {
            retry_at_millis_from_now: retry_at.saturating_duration_since(now).as_millis() as u64,
        }
    }

    /// Record a successful send at `now`. Call only after a send actually
    /// reaches the driver successfully.
    pub fn record_send(&self, now: Instant) {
        self.minute.lock().push(now);
        self.hour.lock().push(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_sends_under_the_limit() {
        let limiter = RateLimiter::new(6, 60);
        let now = Instant::now();
        for _ in 0..6 {
            assert_eq!(limiter.check(now), RateLimitDecision::Allowed);
            limiter.record_send(now);
        }
        assert!(matches!(
            limiter.check(now),
            RateLimitDecision::Deferred { .. }
        ));
    }

    #[test]
    fn defers_until_the_minute_window_edge() {
        let limiter = RateLimiter::new(1, 1000);
        let t0 = Instant::now();
        limiter.record_send(t0);
        match limiter.check(t0 + Duration::from_secs(10)) {
            RateLimitDecision::Deferred {
                retry_at_millis_from_now,
            } => {
                // window edge is t0 + 60s, we're at t0 + 10s, so ~50s left
                assert!(retry_at_millis_from_now >= 49_000 && retry_at_millis_from_now <= 50_000);
            }
            RateLimitDecision::Allowed => panic!("expected deferred"),
        }
    }
}
