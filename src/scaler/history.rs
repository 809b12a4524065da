//! Bounded rolling history of queue snapshots.

use std::collections::VecDeque;
use std::time::Duration;

use super::sampler::QueueSnapshot;

/// Time-bounded deque of [`QueueSnapshot`]s for one queue.
///
/// Pushing prunes everything older than the retention window, so the
/// structure stays bounded regardless of how long the scaler runs.
/// Pruning is relative to the newest sample's timestamp, which keeps the
/// window math deterministic under test.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    retention: Duration,
    samples: VecDeque<QueueSnapshot>,
}

impl SnapshotHistory {
    /// Creates an empty history with the given retention window.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            samples: VecDeque::new(),
        }
    }

    /// Appends a snapshot and prunes samples outside the window.
    pub fn push(&mut self, snapshot: QueueSnapshot) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let cutoff = snapshot.sampled_at - retention;
        self.samples.push_back(snapshot);
        while let Some(front) = self.samples.front() {
            if front.sampled_at < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns the number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the most recent snapshot.
    pub fn latest(&self) -> Option<&QueueSnapshot> {
        self.samples.back()
    }

    /// Returns whether the queue size was strictly increasing over the
    /// last `n` samples. `false` when fewer than `n` samples exist.
    pub fn size_increasing(&self, n: usize) -> bool {
        if n < 2 || self.samples.len() < n {
            return false;
        }
        self.samples
            .iter()
            .skip(self.samples.len() - n)
            .map(QueueSnapshot::queue_size)
            .collect::<Vec<_>>()
            .windows(2)
            .all(|pair| pair[0] < pair[1])
    }

    /// Returns whether the queue has had zero active jobs for at least
    /// `duration`.
    ///
    /// Requires the history to actually cover the span: a queue observed
    /// for 30 seconds cannot be called idle for 60.
    pub fn idle_for(&self, duration: Duration) -> bool {
        let (Some(front), Some(latest)) = (self.samples.front(), self.samples.back()) else {
            return false;
        };
        let Ok(span) = chrono::Duration::from_std(duration) else {
            return false;
        };
        let cutoff = latest.sampled_at - span;
        if front.sampled_at > cutoff {
            return false;
        }
        self.samples
            .iter()
            .filter(|s| s.sampled_at >= cutoff)
            .all(|s| s.counts.active == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobCounts;
    use chrono::{TimeZone, Utc};

    fn snapshot(at_secs: i64, waiting: usize, active: usize) -> QueueSnapshot {
        QueueSnapshot {
            queue: "research".to_string(),
            counts: JobCounts {
                waiting,
                active,
                completed: 0,
                failed: 0,
            },
            avg_wait: Duration::ZERO,
            utilization: 0.0,
            sampled_at: Utc.timestamp_opt(1_700_000_000 + at_secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_push_prunes_outside_retention() {
        let mut history = SnapshotHistory::new(Duration::from_secs(600));
        history.push(snapshot(0, 1, 0));
        history.push(snapshot(300, 2, 0));
        history.push(snapshot(700, 3, 0));

        // The first sample is 700s old relative to the newest, past the
        // 600s window.
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().map(QueueSnapshot::queue_size), Some(3));
    }

    #[test]
    fn test_size_increasing_strictly() {
        let mut history = SnapshotHistory::new(Duration::from_secs(600));
        history.push(snapshot(0, 10, 0));
        history.push(snapshot(10, 20, 0));
        history.push(snapshot(20, 30, 0));
        assert!(history.size_increasing(3));

        history.push(snapshot(30, 30, 0));
        assert!(!history.size_increasing(3));
    }

    #[test]
    fn test_size_increasing_needs_enough_samples() {
        let mut history = SnapshotHistory::new(Duration::from_secs(600));
        history.push(snapshot(0, 10, 0));
        history.push(snapshot(10, 20, 0));
        assert!(!history.size_increasing(3));
    }

    #[test]
    fn test_idle_for_requires_coverage() {
        let mut history = SnapshotHistory::new(Duration::from_secs(600));
        history.push(snapshot(0, 0, 0));
        history.push(snapshot(20, 0, 0));

        // Only 20s observed; cannot claim 60s of idleness.
        assert!(!history.idle_for(Duration::from_secs(60)));

        history.push(snapshot(70, 0, 0));
        assert!(history.idle_for(Duration::from_secs(60)));
    }

    #[test]
    fn test_idle_for_rejects_active_samples_in_window() {
        let mut history = SnapshotHistory::new(Duration::from_secs(600));
        history.push(snapshot(0, 0, 0));
        history.push(snapshot(40, 0, 1));
        history.push(snapshot(80, 0, 0));

        assert!(!history.idle_for(Duration::from_secs(60)));
    }

    #[test]
    fn test_idle_for_ignores_activity_before_window() {
        let mut history = SnapshotHistory::new(Duration::from_secs(600));
        history.push(snapshot(0, 0, 2));
        history.push(snapshot(40, 0, 0));
        history.push(snapshot(110, 0, 0));

        // The active sample is 110s old, outside the 60s idle window.
        assert!(history.idle_for(Duration::from_secs(60)));
    }

    #[test]
    fn test_empty_history_answers_conservatively() {
        let history = SnapshotHistory::new(Duration::from_secs(600));
        assert!(history.is_empty());
        assert!(history.latest().is_none());
        assert!(!history.size_increasing(3));
        assert!(!history.idle_for(Duration::from_secs(60)));
    }
}
