//! Rolling outcome window.

use gatekeeper_core::CircuitPolicy;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Outcomes of recent calls, bounded by age and count.
#[derive(Debug, Default)]
pub(crate) struct OutcomeWindow {
    entries: VecDeque<(Instant, bool)>,
}

impl OutcomeWindow {
    pub(crate) fn push(&mut self, now: Instant, failed: bool, policy: &CircuitPolicy) {
        self.entries.push_back((now, failed));
        self.trim(now, policy.window(), *policy.window_size());
    }

    pub(crate) fn trim(&mut self, now: Instant, age: Duration, size: usize) {
        while let Some(&(at, _)) = self.entries.front() {
            if now.saturating_duration_since(at) > age || self.entries.len() > size {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn failures(&self) -> u32 {
        self.entries.iter().filter(|(_, failed)| *failed).count() as u32
    }

    pub(crate) fn calls(&self) -> u32 {
        self.entries.len() as u32
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether the window holds enough failures to open the circuit.
    pub(crate) fn should_open(&self, policy: &CircuitPolicy) -> bool {
        let failures = self.failures();
        if failures < *policy.failure_threshold() {
            return false;
        }
        f64::from(failures) / f64::from(self.calls()) >= *policy.failure_ratio()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::CircuitPolicyBuilder;

    fn policy() -> CircuitPolicy {
        CircuitPolicyBuilder::default()
            .failure_threshold(3u32)
            .failure_ratio(0.5)
            .window_secs(10u64)
            .window_size(6usize)
            .build()
            .unwrap()
    }

    #[test]
    fn threshold_and_ratio_must_both_hold() {
        let policy = policy();
        let mut window = OutcomeWindow::default();
        let now = Instant::now();

        for _ in 0..4 {
            window.push(now, false, &policy);
        }
        for _ in 0..2 {
            window.push(now, true, &policy);
        }
        assert!(!window.should_open(&policy));

        // Count bound drops the oldest success: 3 failures of 6.
        window.push(now, true, &policy);
        assert_eq!(window.calls(), 6);
        assert!(window.should_open(&policy));
    }

    #[test]
    fn old_outcomes_leave_the_window() {
        let policy = policy();
        let mut window = OutcomeWindow::default();
        let start = Instant::now();

        window.push(start, true, &policy);
        window.push(start, true, &policy);
        window.push(start + Duration::from_secs(11), true, &policy);

        assert_eq!(window.failures(), 1);
        assert!(!window.should_open(&policy));
    }
}
