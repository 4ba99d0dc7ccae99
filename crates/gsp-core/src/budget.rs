//! Global image budget shared across workloads.
//!
//! When `MAX_IMAGES` is configured, the discover pipeline and the request
//! inbox draw from the same pool so a worker never produces more than the
//! cap in total. Without a cap every reservation is granted.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct ImageBudget {
    limit: Option<u64>,
    used: AtomicU64,
}

impl ImageBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Remaining images, `None` when unlimited.
    pub fn remaining(&self) -> Option<u64> {
        self.limit
            .map(|l| l.saturating_sub(self.used.load(Ordering::Relaxed)))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining(), Some(0))
    }

    /// Reserve up to `requested` images; returns the number granted.
    pub fn try_take(&self, requested: u64) -> u64 {
        let Some(limit) = self.limit else {
            self.used.fetch_add(requested, Ordering::Relaxed);
            return requested;
        };
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let available = limit.saturating_sub(current);
            let take = requested.min(available);
            if take == 0 {
                return 0;
            }
            match self.used.compare_exchange_weak(
                current,
                current + take,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return take,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_budget_always_grants() {
        let b = ImageBudget::new(None);
        assert_eq!(b.try_take(5), 5);
        assert_eq!(b.remaining(), None);
        assert!(!b.is_exhausted());
    }

    #[test]
    fn capped_budget_grants_until_exhausted() {
        let b = ImageBudget::new(Some(3));
        assert_eq!(b.try_take(1), 1);
        assert_eq!(b.try_take(5), 2);
        assert_eq!(b.try_take(1), 0);
        assert!(b.is_exhausted());
        assert_eq!(b.used(), 3);
    }

    #[test]
    fn zero_cap_is_immediately_exhausted() {
        let b = ImageBudget::new(Some(0));
        assert!(b.is_exhausted());
        assert_eq!(b.try_take(1), 0);
    }
}
