//! Keyed registry of token buckets.

use crate::budget::{BudgetSnapshot, Decision, MethodBudget};
use gatekeeper_core::GatekeeperConfig;
use gatekeeper_error::{CallError, CallResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type SharedBudget = Arc<Mutex<MethodBudget>>;

/// Rate limiter holding one token bucket per key.
///
/// Buckets are created on first use from the policy of the method that
/// first touches the key. Waiting callers are served in reservation order.
///
/// # Example
///
/// ```rust,no_run
/// use gatekeeper_core::GatekeeperConfig;
/// use gatekeeper_rate_limit::RateLimiter;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = RateLimiter::new(Arc::new(GatekeeperConfig::load()?));
/// let grant = limiter.acquire("friends.get", "friends.get", 1).await?;
/// println!("admitted after {:?}", grant.waited());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    config: Arc<GatekeeperConfig>,
    budgets: Mutex<HashMap<String, SharedBudget>>,
}

impl RateLimiter {
    /// Create a limiter resolving policies from `config`.
    pub fn new(config: Arc<GatekeeperConfig>) -> Self {
        Self {
            config,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    fn budget(&self, method: &str, key: &str) -> SharedBudget {
        let mut budgets = lock(&self.budgets);
        budgets
            .entry(key.to_string())
            .or_insert_with(|| {
                let policy = self.config.for_method(method);
                debug!(
                    method,
                    key,
                    capacity = policy.rate_limit().capacity(),
                    refill_per_sec = policy.rate_limit().refill_per_sec(),
                    "Created token bucket"
                );
                Arc::new(Mutex::new(MethodBudget::new(
                    method,
                    policy.rate_limit(),
                    Instant::now(),
                )))
            })
            .clone()
    }

    /// Ask for `units` without waiting.
    ///
    /// Returns a [`Grant`] when the units are free, or a [`Reservation`]
    /// holding the caller's place in line.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` when the wait would exceed the method's
    /// `max_wait_ms` or `units` exceeds the bucket capacity. Nothing is
    /// reserved in that case.
    #[instrument(skip(self))]
    pub fn reserve(&self, method: &str, key: &str, units: u32) -> CallResult<Admission> {
        let budget = self.budget(method, key);
        let units = f64::from(units.max(1));
        let now = Instant::now();

        let decision = lock(&budget).admit(units, now);
        match decision {
            Decision::Granted => {
                debug!("Admitted immediately");
                Ok(Admission::Granted(Grant {
                    waited: Duration::ZERO,
                    budget,
                    units,
                }))
            }
            Decision::Wait(wait) => {
                debug!(wait_ms = wait.as_millis() as u64, "Queued for tokens");
                Ok(Admission::Pending(Reservation {
                    budget,
                    units,
                    wait,
                    started: now,
                    settled: false,
                }))
            }
            Decision::Reject(wait) => {
                let max_wait = self.config.for_method(method).rate_limit().max_wait();
                warn!(
                    max_wait_ms = max_wait.as_millis() as u64,
                    "Admission wait exceeds maximum"
                );
                Err(CallError::rate_limited(key, wait, max_wait))
            }
        }
    }

    /// Wait until `units` are available.
    ///
    /// Dropping the returned future before it resolves releases the
    /// reservation.
    ///
    /// # Errors
    ///
    /// Same as [`RateLimiter::reserve`].
    pub async fn acquire(&self, method: &str, key: &str, units: u32) -> CallResult<Grant> {
        match self.reserve(method, key, units)? {
            Admission::Granted(grant) => Ok(grant),
            Admission::Pending(reservation) => Ok(reservation.ready().await),
        }
    }

    /// Take `units` only if they are free right now.
    pub fn try_acquire(&self, method: &str, key: &str, units: u32) -> Option<Grant> {
        match self.reserve(method, key, units) {
            Ok(Admission::Granted(grant)) => Some(grant),
            // Dropping the reservation gives the place in line back.
            Ok(Admission::Pending(_)) | Err(_) => None,
        }
    }

    /// Current state of the bucket for `key`, if it exists.
    pub fn snapshot(&self, key: &str) -> Option<BudgetSnapshot> {
        let budget = lock(&self.budgets).get(key).cloned()?;
        let snapshot = lock(&budget).snapshot(Instant::now());
        Some(snapshot)
    }

    /// Units currently available for `key`.
    pub fn tokens_available(&self, key: &str) -> Option<f64> {
        self.snapshot(key).map(|s| *s.tokens())
    }

    /// Keys with a bucket.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.budgets).keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Outcome of [`RateLimiter::reserve`].
#[derive(Debug)]
pub enum Admission {
    /// Units were taken.
    Granted(Grant),
    /// Units are promised after a wait.
    Pending(Reservation),
}

/// Proof that units were taken from a bucket.
#[derive(Debug)]
pub struct Grant {
    waited: Duration,
    budget: SharedBudget,
    units: f64,
}

impl Grant {
    /// Time spent waiting for admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Put the units back because the admitted work was never dispatched.
    pub fn refund(self) {
        lock(&self.budget).refund(self.units, Instant::now());
        debug!(units = self.units, "Refunded unused grant");
    }
}

/// A place in line for units that are not yet available.
///
/// Dropping an unredeemed reservation returns its units to the queue
/// without consuming any tokens.
#[derive(Debug)]
pub struct Reservation {
    budget: SharedBudget,
    units: f64,
    wait: Duration,
    started: Instant,
    settled: bool,
}

impl Reservation {
    /// Estimated wait computed at reservation time.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Sleep until the reserved units can be taken, then take them.
    pub async fn ready(mut self) -> Grant {
        let mut deadline = self.started + self.wait;
        loop {
            tokio::time::sleep_until(deadline).await;
            let now = Instant::now();
            let shortfall = {
                let mut budget = lock(&self.budget);
                budget.redeem(self.units, now)
            };
            match shortfall {
                None => break,
                Some(more) => deadline = now + more,
            }
        }
        self.settled = true;
        Grant {
            waited: self.started.elapsed(),
            budget: Arc::clone(&self.budget),
            units: self.units,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.budget).release(self.units);
            debug!(units = self.units, "Released unredeemed reservation");
        }
    }
}
