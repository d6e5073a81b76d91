//! Search budget shared by every cascade run holding the same tracker.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

/// Cost of one operation in search units.
pub struct OperationCost;

impl OperationCost {
    /// One fan-out over every configured collector.
    pub const ENTITY_SEARCH: u64 = 1;
}

/// Caps upstream searches. Reservation is a single compare-and-swap, so
/// concurrent runs sharing one tracker never exceed `limit` together.
#[derive(Debug)]
pub struct BudgetTracker {
    /// `None` when unlimited.
    limit: Option<u64>,
    spent: AtomicU64,
}

impl BudgetTracker {
    /// A tracker allowing `limit` search units. Zero means unlimited.
    pub fn new(limit: u64) -> Self {
        Self {
            limit: (limit > 0).then_some(limit),
            spent: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Reserve `cost` units. Returns false, and reserves nothing, when the
    /// reservation would take the total past the limit.
    pub fn try_spend(&self, cost: u64) -> bool {
        let Some(limit) = self.limit else {
            self.spent.fetch_add(cost, Ordering::Relaxed);
            return true;
        };
        let reserved = self
            .spent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |spent| {
                spent.checked_add(cost).filter(|total| *total <= limit)
            });
        if reserved.is_err() {
            debug!(cost, limit, "Search budget refused reservation");
        }
        reserved.is_ok()
    }

    pub fn spent(&self) -> u64 {
        self.spent.load(Ordering::Acquire)
    }

    /// Units left, or `None` when unlimited.
    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.spent()))
    }

    pub fn log_status(&self) {
        if let Some(limit) = self.limit {
            info!(
                spent = self.spent(),
                remaining = limit.saturating_sub(self.spent()),
                limit,
                "Search budget status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_never_refuses() {
        let budget = BudgetTracker::unlimited();
        assert!(budget.try_spend(1_000));
        assert!(budget.try_spend(1_000));
        assert_eq!(budget.spent(), 2_000);
        assert_eq!(budget.remaining(), None);
    }

    #[test]
    fn refused_reservations_cost_nothing() {
        let budget = BudgetTracker::new(3);
        assert!(budget.try_spend(OperationCost::ENTITY_SEARCH));
        assert!(budget.try_spend(OperationCost::ENTITY_SEARCH));
        assert!(!budget.try_spend(2));
        assert_eq!(budget.remaining(), Some(1));
        assert!(budget.try_spend(1));
        assert!(!budget.try_spend(1));
        assert_eq!(budget.spent(), 3);
    }

    #[test]
    fn threads_sharing_a_budget_never_exceed_it() {
        let budget = std::sync::Arc::new(BudgetTracker::new(50));
        let granted: u64 = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let budget = &budget;
                    scope.spawn(move || (0..100).filter(|_| budget.try_spend(1)).count() as u64)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(granted, 50);
        assert_eq!(budget.spent(), 50);
    }
}
