/// Poll-interval multipliers: a global one driven by idle runs, and a
/// per-repository one driven by consecutive failures.
use std::time::Duration;

/// Grows the global poll interval while completed runs find nothing to do.
///
/// Every `window` consecutive zero-yield runs double the multiplier, up to
/// `max_multiplier`. Any productive run resets it to 1.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    window: usize,
    max_multiplier: u32,
    idle_streak: usize,
}

impl IdleBackoff {
    pub fn new(window: usize, max_multiplier: u32) -> Self {
        Self {
            window: window.max(1),
            max_multiplier: max_multiplier.max(1),
            idle_streak: 0,
        }
    }

    /// Record a completed run. Returns the multiplier now in effect.
    pub fn record(&mut self, enriched: usize) -> u32 {
        if enriched > 0 {
            self.idle_streak = 0;
        } else {
            self.idle_streak = self.idle_streak.saturating_add(1);
        }
        self.multiplier()
    }

    pub fn multiplier(&self) -> u32 {
        let doublings = self.idle_streak / self.window;
        capped_power_of_two(doublings, self.max_multiplier)
    }

    pub fn idle_streak(&self) -> usize {
        self.idle_streak
    }

    pub fn interval(&self, base: Duration) -> Duration {
        base.saturating_mul(self.multiplier())
    }
}

/// Multiplier for a repository with `consecutive_failures` failed runs.
/// 1 until `degraded_after`, then doubling per further failure.
pub fn failure_multiplier(consecutive_failures: u32, degraded_after: u32, max_multiplier: u32) -> u32 {
    if consecutive_failures < degraded_after.max(1) {
        return 1;
    }
    let doublings = (consecutive_failures - degraded_after.max(1) + 1) as usize;
    capped_power_of_two(doublings, max_multiplier.max(1))
}

fn capped_power_of_two(exponent: usize, cap: u32) -> u32 {
    if exponent >= 32 {
        return cap;
    }
    1u32.checked_shl(exponent as u32).unwrap_or(u32::MAX).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_backoff_grows_and_resets() {
        let mut idle = IdleBackoff::new(3, 8);
        assert_eq!(idle.record(0), 1);
        assert_eq!(idle.record(0), 1);
        assert_eq!(idle.record(0), 2);
        for _ in 0..3 {
            idle.record(0);
        }
        assert_eq!(idle.multiplier(), 4);
        for _ in 0..30 {
            idle.record(0);
        }
        assert_eq!(idle.multiplier(), 8);
        assert_eq!(idle.interval(Duration::from_secs(10)), Duration::from_secs(80));

        assert_eq!(idle.record(5), 1);
        assert_eq!(idle.idle_streak(), 0);
        assert_eq!(idle.interval(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_failure_multiplier() {
        assert_eq!(failure_multiplier(0, 3, 32), 1);
        assert_eq!(failure_multiplier(2, 3, 32), 1);
        assert_eq!(failure_multiplier(3, 3, 32), 2);
        assert_eq!(failure_multiplier(4, 3, 32), 4);
        assert_eq!(failure_multiplier(10, 3, 32), 32);
        assert_eq!(failure_multiplier(u32::MAX, 3, 32), 32);
    }
}
