/// Per-backend spend against daily and monthly budgets (UTC calendar
/// periods). Independent of the circuit breaker.
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::BudgetConfig;
use crate::error::FailureKind;

/// Absorbs float noise when spend lands exactly on the limit.
const EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Spend {
    day: NaiveDate,
    month: (i32, u32),
    daily: f64,
    monthly: f64,
    exhausted_logged: bool,
}

impl Spend {
    fn roll(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day != self.day {
            self.day = day;
            self.daily = 0.0;
            self.exhausted_logged = false;
        }
        let month = (now.year(), now.month());
        if month != self.month {
            self.month = month;
            self.monthly = 0.0;
            self.exhausted_logged = false;
        }
    }
}

/// Point-in-time view of a tracker, for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSnapshot {
    pub backend: String,
    pub day: String,
    pub daily_spent: f64,
    pub daily_limit: Option<f64>,
    pub month: String,
    pub monthly_spent: f64,
    pub monthly_limit: Option<f64>,
}

pub struct CostTracker {
    backend: String,
    daily_limit: Option<f64>,
    monthly_limit: Option<f64>,
    spend: Mutex<Spend>,
}

impl CostTracker {
    pub fn new(backend: &str, budget: &BudgetConfig) -> Self {
        let now = Utc::now();
        Self {
            backend: backend.to_string(),
            daily_limit: budget.daily_usd,
            monthly_limit: budget.monthly_usd,
            spend: Mutex::new(Spend {
                day: now.date_naive(),
                month: (now.year(), now.month()),
                daily: 0.0,
                monthly: 0.0,
                exhausted_logged: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Spend> {
        self.spend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self, estimate: f64) -> Result<(), FailureKind> {
        self.check_at(Utc::now(), estimate)
    }

    /// Refuse the call if `estimate` would push either period over budget.
    pub fn check_at(&self, now: DateTime<Utc>, estimate: f64) -> Result<(), FailureKind> {
        let mut spend = self.lock();
        spend.roll(now);

        let over = |spent: f64, limit: Option<f64>| {
            limit.is_some_and(|limit| spent + estimate > limit + EPSILON)
        };
        if over(spend.daily, self.daily_limit) || over(spend.monthly, self.monthly_limit) {
            if !spend.exhausted_logged {
                spend.exhausted_logged = true;
                warn!(
                    backend = %self.backend,
                    daily_spent = spend.daily,
                    monthly_spent = spend.monthly,
                    "Budget exhausted, refusing calls until the period rolls over"
                );
            }
            return Err(FailureKind::BudgetExceeded);
        }
        Ok(())
    }

    pub fn record(&self, cost: f64) {
        self.record_at(Utc::now(), cost);
    }

    pub fn record_at(&self, now: DateTime<Utc>, cost: f64) {
        let mut spend = self.lock();
        spend.roll(now);
        spend.daily += cost;
        spend.monthly += cost;
    }

    pub fn snapshot(&self) -> CostSnapshot {
        let spend = self.lock();
        CostSnapshot {
            backend: self.backend.clone(),
            day: spend.day.to_string(),
            daily_spent: spend.daily,
            daily_limit: self.daily_limit,
            month: format!("{:04}-{:02}", spend.month.0, spend.month.1),
            monthly_spent: spend.monthly,
            monthly_limit: self.monthly_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker(daily: Option<f64>, monthly: Option<f64>) -> CostTracker {
        CostTracker::new(
            "b",
            &BudgetConfig {
                daily_usd: daily,
                monthly_usd: monthly,
                usd_per_1k_tokens: 0.0,
            },
        )
    }

    #[test]
    fn test_daily_budget_exact_fit() {
        let t = tracker(Some(0.5), None);
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        for _ in 0..5 {
            t.check_at(now, 0.1).unwrap();
            t.record_at(now, 0.1);
        }
        assert_eq!(t.check_at(now, 0.1), Err(FailureKind::BudgetExceeded));
    }

    #[test]
    fn test_daily_rollover() {
        let t = tracker(Some(1.0), None);
        let day1 = Utc.with_ymd_and_hms(2026, 3, 10, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 3, 11, 0, 1, 0).unwrap();
        t.record_at(day1, 1.0);
        assert!(t.check_at(day1, 0.01).is_err());
        assert!(t.check_at(day2, 0.01).is_ok());
        assert_eq!(t.snapshot().day, "2026-03-11");
    }

    #[test]
    fn test_monthly_budget() {
        let t = tracker(None, Some(2.0));
        let march = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap();
        let april = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        t.record_at(march, 1.5);
        t.record_at(later, 0.5);
        assert_eq!(t.check_at(later, 0.1), Err(FailureKind::BudgetExceeded));
        assert!(t.check_at(april, 0.1).is_ok());

        let snap = t.snapshot();
        assert_eq!(snap.month, "2026-04");
        assert_eq!(snap.monthly_spent, 0.0);
    }

    #[test]
    fn test_unlimited() {
        let t = tracker(None, None);
        t.record(1_000.0);
        assert!(t.check(1_000.0).is_ok());
    }
}
