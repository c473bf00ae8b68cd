//! Health snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::BreakerSnapshot;
use crate::dispatcher::DispatcherStatsSnapshot;
use crate::store::QueueDepth;

/// Global outcome counters and rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutcomeTotals {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub requeued: u64,
    pub attempts: u64,
    /// `completed / (completed + failed)`, 0 when nothing finished.
    pub success_rate: f64,
    /// `failed / (completed + failed)`, 0 when nothing finished.
    pub failure_rate: f64,
}

impl From<DispatcherStatsSnapshot> for OutcomeTotals {
    fn from(stats: DispatcherStatsSnapshot) -> Self {
        let finished = stats.completed + stats.failed;
        let rate = |n: u64| {
            if finished == 0 {
                0.0
            } else {
                n as f64 / finished as f64
            }
        };
        Self {
            completed: stats.completed,
            failed: stats.failed,
            cancelled: stats.cancelled,
            requeued: stats.requeued,
            attempts: stats.attempts,
            success_rate: rate(stats.completed),
            failure_rate: rate(stats.failed),
        }
    }
}

/// Point-in-time health of the orchestration core.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub breakers: Vec<BreakerSnapshot>,
    pub queue_depth: QueueDepth,
    pub totals: OutcomeTotals,
    pub generated_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Backends whose breaker is not closed.
    pub fn degraded_backends(&self) -> Vec<&str> {
        self.breakers
            .iter()
            .filter(|b| b.state != crate::breaker::CircuitState::Closed)
            .map(|b| b.backend_id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let totals = OutcomeTotals::from(DispatcherStatsSnapshot {
            completed: 3,
            failed: 1,
            cancelled: 5,
            ..Default::default()
        });
        assert!((totals.success_rate - 0.75).abs() < f64::EPSILON);
        assert!((totals.failure_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(totals.cancelled, 5);
    }

    #[test]
    fn test_rates_with_nothing_finished() {
        let totals = OutcomeTotals::from(DispatcherStatsSnapshot::default());
        assert_eq!(totals.success_rate, 0.0);
        assert_eq!(totals.failure_rate, 0.0);
    }
}
