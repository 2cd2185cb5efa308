//! Queue statistics snapshot.

use std::collections::BTreeMap;

use serde::Serialize;

use super::Priority;

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Pending tasks per priority tier.
    pub pending_by_priority: BTreeMap<Priority, usize>,
    /// Tasks currently held by workers.
    pub in_flight: usize,
    /// Tasks accepted over the queue's lifetime.
    pub total_added: u64,
    /// Submissions rejected because the key was outstanding.
    pub duplicates_rejected: u64,
    /// Submissions rejected because the key had already completed.
    pub already_completed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Total pending tasks across tiers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending_by_priority.values().sum()
    }

    /// Pending tasks in one tier.
    #[must_use]
    pub fn pending_for(&self, priority: Priority) -> usize {
        self.pending_by_priority.get(&priority).copied().unwrap_or(0)
    }

    /// All rejected submissions.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.duplicates_rejected + self.already_completed
    }

    /// Fraction of submissions rejected as duplicates (0.0 when nothing was submitted).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn dedup_rate(&self) -> f64 {
        let submitted = self.total_added + self.rejected();
        if submitted == 0 {
            0.0
        } else {
            self.rejected() as f64 / submitted as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_rate_zero_when_empty() {
        assert!(QueueStats::default().dedup_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_dedup_rate_counts_both_rejection_kinds() {
        let stats = QueueStats {
            total_added: 6,
            duplicates_rejected: 1,
            already_completed: 1,
            ..QueueStats::default()
        };
        assert_eq!(stats.rejected(), 2);
        assert!((stats.dedup_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pending_for_missing_tier_is_zero() {
        let stats = QueueStats::default();
        assert_eq!(stats.pending_for(Priority::Tribunal), 0);
        assert_eq!(stats.pending(), 0);
    }
}
