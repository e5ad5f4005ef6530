//! Token bucket arithmetic.

use derive_getters::Getters;
use gatekeeper_core::RateLimitPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

// Tolerance for float drift between a computed wake-up time and the refill at that time.
const EPSILON: f64 = 1e-6;

/// Result of asking a budget for units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Decision {
    /// Units were taken.
    Granted,
    /// Units are reserved; the caller may take them after the wait.
    Wait(Duration),
    /// The wait would exceed the configured maximum; nothing was reserved.
    Reject(Duration),
}

/// Token bucket state of one rate-limit key.
///
/// `0 ≤ tokens ≤ capacity` holds after every operation. Units promised to
/// queued callers are tracked in `reserved` rather than by driving `tokens`
/// negative.
#[derive(Debug)]
pub struct MethodBudget {
    method: String,
    capacity: f64,
    refill_per_sec: f64,
    max_wait: Duration,
    tokens: f64,
    reserved: f64,
    waiters: usize,
    last_refill: Instant,
}

impl MethodBudget {
    /// Full bucket for `method` configured from `policy`.
    pub fn new(method: impl Into<String>, policy: &RateLimitPolicy, now: Instant) -> Self {
        let capacity = f64::from(*policy.capacity());
        Self {
            method: method.into(),
            capacity,
            refill_per_sec: *policy.refill_per_sec(),
            max_wait: policy.max_wait(),
            tokens: capacity,
            reserved: 0.0,
            waiters: 0,
            last_refill: now,
        }
    }

    /// Add the units earned since the last refill, capped at capacity.
    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Units currently in the bucket.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Time until `units` more units have been earned.
    fn time_to_earn(&self, units: f64) -> Duration {
        if units <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(units / self.refill_per_sec).unwrap_or(Duration::MAX)
    }

    pub(crate) fn admit(&mut self, units: f64, now: Instant) -> Decision {
        self.refill(now);

        if units > self.capacity {
            return Decision::Reject(Duration::MAX);
        }

        let free = self.tokens - self.reserved;
        if free >= units {
            self.tokens -= units;
            return Decision::Granted;
        }

        let wait = self.time_to_earn(units - free);
        if wait > self.max_wait {
            return Decision::Reject(wait);
        }

        self.reserved += units;
        self.waiters += 1;
        Decision::Wait(wait)
    }

    /// Take reserved units, or report how much longer the caller must wait.
    pub(crate) fn redeem(&mut self, units: f64, now: Instant) -> Option<Duration> {
        self.refill(now);

        if self.tokens + EPSILON >= units {
            self.tokens = (self.tokens - units).max(0.0);
            self.reserved = (self.reserved - units).max(0.0);
            self.waiters = self.waiters.saturating_sub(1);
            return None;
        }

        Some(self.time_to_earn(units - self.tokens))
    }

    /// Give back a reservation that will never be redeemed.
    pub(crate) fn release(&mut self, units: f64) {
        self.reserved = (self.reserved - units).max(0.0);
        self.waiters = self.waiters.saturating_sub(1);
    }

    /// Return units taken by a grant that was never used.
    pub(crate) fn refund(&mut self, units: f64, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens + units).min(self.capacity);
    }

    /// Point-in-time view of this budget.
    pub fn snapshot(&mut self, now: Instant) -> BudgetSnapshot {
        self.refill(now);
        BudgetSnapshot {
            method: self.method.clone(),
            tokens: self.tokens,
            capacity: self.capacity,
            reserved: self.reserved,
            waiters: self.waiters,
        }
    }
}

/// Observable state of a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct BudgetSnapshot {
    /// Method the budget was configured for
    method: String,
    /// Units currently available
    tokens: f64,
    /// Bucket capacity
    capacity: f64,
    /// Units promised to queued callers
    reserved: f64,
    /// Callers queued for units
    waiters: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::RateLimitPolicyBuilder;

    fn budget(capacity: u32, refill: f64, max_wait_ms: u64) -> (MethodBudget, Instant) {
        let policy = RateLimitPolicyBuilder::default()
            .capacity(capacity)
            .refill_per_sec(refill)
            .max_wait_ms(max_wait_ms)
            .build()
            .unwrap();
        let now = Instant::now();
        (MethodBudget::new("friends.get", &policy, now), now)
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let (mut b, now) = budget(3, 3.0, 10_000);
        assert_eq!(b.admit(3.0, now), Decision::Granted);
        assert_eq!(b.tokens(), 0.0);

        b.refill(now + Duration::from_millis(500));
        assert!((b.tokens() - 1.5).abs() < 1e-9);

        b.refill(now + Duration::from_secs(60));
        assert_eq!(b.tokens(), 3.0);
    }

    #[test]
    fn waiters_queue_behind_reservations() {
        let (mut b, now) = budget(2, 2.0, 10_000);
        assert_eq!(b.admit(1.0, now), Decision::Granted);
        assert_eq!(b.admit(1.0, now), Decision::Granted);

        let Decision::Wait(first) = b.admit(1.0, now) else {
            panic!("expected wait")
        };
        let Decision::Wait(second) = b.admit(1.0, now) else {
            panic!("expected wait")
        };
        assert_eq!(first, Duration::from_millis(500));
        assert_eq!(second, Duration::from_secs(1));
        assert_eq!(b.waiters, 2);
        assert_eq!(b.tokens(), 0.0);
    }

    #[test]
    fn release_restores_queue_position() {
        let (mut b, now) = budget(1, 1.0, 10_000);
        assert_eq!(b.admit(1.0, now), Decision::Granted);
        let Decision::Wait(_) = b.admit(1.0, now) else {
            panic!("expected wait")
        };
        b.release(1.0);
        assert_eq!(b.reserved, 0.0);
        assert_eq!(b.waiters, 0);
        assert_eq!(b.admit(1.0, now), Decision::Wait(Duration::from_secs(1)));
    }

    #[test]
    fn redeem_reports_shortfall() {
        let (mut b, now) = budget(1, 1.0, 10_000);
        assert_eq!(b.admit(1.0, now), Decision::Granted);
        let Decision::Wait(wait) = b.admit(1.0, now) else {
            panic!("expected wait")
        };
        let early = b.redeem(1.0, now + wait / 2);
        assert_eq!(early, Some(Duration::from_millis(500)));
        assert_eq!(b.redeem(1.0, now + wait), None);
        assert_eq!(b.tokens(), 0.0);
        assert_eq!(b.reserved, 0.0);
    }

    #[test]
    fn refund_never_exceeds_capacity() {
        let (mut b, now) = budget(2, 1.0, 10_000);
        assert_eq!(b.admit(1.0, now), Decision::Granted);
        b.refund(1.0, now);
        assert_eq!(b.tokens(), 2.0);
        b.refund(1.0, now);
        assert_eq!(b.tokens(), 2.0);
    }

    #[test]
    fn oversized_and_slow_requests_are_rejected() {
        let (mut b, now) = budget(3, 1.0, 1_000);
        assert_eq!(b.admit(4.0, now), Decision::Reject(Duration::MAX));

        assert_eq!(b.admit(3.0, now), Decision::Granted);
        assert_eq!(b.admit(2.0, now), Decision::Reject(Duration::from_secs(2)));
        assert_eq!(b.reserved, 0.0);
    }
}
