//! Hourly request budget for commit-detail fetches
//!
//! The budget refills to its hourly limit when its window resets. Upstream
//! rate-limit headers only ever lower the local count, so the collector
//! never spends more than either side believes is left.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use repopulse_core::Clock;
use tracing::{debug, warn};

use crate::upstream::RateLimitInfo;

/// Requests per hour without a credential
pub const UNAUTHENTICATED_HOURLY: u32 = 60;
/// Requests per hour with a credential
pub const AUTHENTICATED_HOURLY: u32 = 5000;

pub struct RateBudget {
    limit: u32,
    remaining: u32,
    resets_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl RateBudget {
    pub fn new(limit: u32, clock: Arc<dyn Clock>) -> Self {
        let resets_at = clock.now() + Duration::hours(1);
        Self {
            limit,
            remaining: limit,
            resets_at,
            clock,
        }
    }

    /// Budget for an authenticated or anonymous client.
    pub fn for_credential(authenticated: bool, clock: Arc<dyn Clock>) -> Self {
        let limit = if authenticated {
            AUTHENTICATED_HOURLY
        } else {
            UNAUTHENTICATED_HOURLY
        };
        Self::new(limit, clock)
    }

    fn refill(&mut self) {
        let now = self.clock.now();
        if now >= self.resets_at {
            self.remaining = self.limit;
            self.resets_at = now + Duration::hours(1);
            debug!("Rate budget refilled to {}", self.limit);
        }
    }

    /// Spend one request if any are left.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Requests left in the current window.
    pub fn remaining(&mut self) -> u32 {
        self.refill();
        self.remaining
    }

    /// Clamp to what the upstream reports.
    pub fn observe(&mut self, info: &RateLimitInfo) {
        self.refill();
        if info.remaining < self.remaining {
            self.remaining = info.remaining;
            self.resets_at = info.reset_at;
        }
    }

    /// Spend nothing more until the upstream window resets.
    pub fn exhaust(&mut self, info: &RateLimitInfo) {
        warn!("Rate limit exhausted until {}", info.reset_at);
        self.remaining = 0;
        self.resets_at = info.reset_at.max(self.clock.now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use repopulse_core::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_limits_by_credential() {
        let clock = clock();
        assert_eq!(
            RateBudget::for_credential(false, clock.clone()).remaining(),
            UNAUTHENTICATED_HOURLY
        );
        assert_eq!(
            RateBudget::for_credential(true, clock).remaining(),
            AUTHENTICATED_HOURLY
        );
    }

    #[test]
    fn test_exhaustion_and_refill() {
        let clock = clock();
        let mut budget = RateBudget::new(2, clock.clone());
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());

        clock.advance(Duration::minutes(59));
        assert!(!budget.try_acquire());

        clock.advance(Duration::minutes(1));
        assert!(budget.try_acquire());
        assert_eq!(budget.remaining(), 1);
    }

    #[test]
    fn test_headers_only_lower_the_budget() {
        let clock = clock();
        let mut budget = RateBudget::new(60, clock.clone());
        let reset_at = clock.now() + Duration::minutes(10);

        budget.observe(&RateLimitInfo {
            remaining: 5000,
            reset_at,
        });
        assert_eq!(budget.remaining(), 60);

        budget.observe(&RateLimitInfo {
            remaining: 3,
            reset_at,
        });
        assert_eq!(budget.remaining(), 3);

        // Upstream window resets earlier than the local one
        clock.advance(Duration::minutes(10));
        assert_eq!(budget.remaining(), 60);
    }

    #[test]
    fn test_exhaust_until_reset() {
        let clock = clock();
        let mut budget = RateBudget::new(60, clock.clone());
        budget.exhaust(&RateLimitInfo {
            remaining: 0,
            reset_at: clock.now() + Duration::minutes(5),
        });
        assert!(!budget.try_acquire());

        clock.advance(Duration::minutes(5));
        assert!(budget.try_acquire());
    }
}
