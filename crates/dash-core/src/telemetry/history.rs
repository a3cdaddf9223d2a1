//! Bounded, time-windowed sample history

use crate::models::HistoryPoint;
use std::collections::VecDeque;
use std::time::Duration;

/// Default number of points kept (one hour at a 2s cadence)
pub const DEFAULT_HISTORY_CAPACITY: usize = 1800;

/// Default retention window
pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Ring buffer of [`HistoryPoint`]s bounded by count and by age
#[derive(Debug, Clone)]
pub struct RingHistory {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
    window_millis: i64,
}

impl Default for RingHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_WINDOW)
    }
}

impl RingHistory {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            window_millis: window.as_millis() as i64,
        }
    }

    /// Append a point, then enforce both the capacity and the age bound.
    ///
    /// `now` is Unix milliseconds. Timestamps never go backwards: a point
    /// older than the newest stored one is stamped with the newest timestamp.
    pub fn append(&mut self, mut point: HistoryPoint, now: i64) {
        if let Some(last) = self.points.back() {
            if point.timestamp < last.timestamp {
                point.timestamp = last.timestamp;
            }
        }

        self.points.push_back(point);

        while self.points.len() > self.capacity {
            self.points.pop_front();
        }

        let cutoff = now - self.window_millis;
        while let Some(front) = self.points.front() {
            if front.timestamp < cutoff {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    /// Ordered copy of the stored points
    pub fn snapshot(&self) -> Vec<HistoryPoint> {
        self.points.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn oldest(&self) -> Option<&HistoryPoint> {
        self.points.front()
    }

    pub fn newest(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HistoryNetwork;

    fn point(ts: i64) -> HistoryPoint {
        HistoryPoint {
            network: HistoryNetwork::default(),
            cpu: 1.0,
            memory: 2.0,
            timestamp: ts,
        }
    }

    #[test]
    fn test_capacity_bound() {
        let mut history = RingHistory::new(3, Duration::from_secs(3600));
        for ts in 0..10 {
            history.append(point(ts), ts);
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.oldest().unwrap().timestamp, 7);
        assert_eq!(history.newest().unwrap().timestamp, 9);
    }

    #[test]
    fn test_window_bound_drops_stale_points() {
        let mut history = RingHistory::new(100, Duration::from_secs(10));
        history.append(point(0), 0);
        history.append(point(5_000), 5_000);
        history.append(point(12_000), 12_000);

        // cutoff = 2_000
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].timestamp, 5_000);
    }

    #[test]
    fn test_window_uses_now_not_point_timestamp() {
        let mut history = RingHistory::new(100, Duration::from_secs(10));
        history.append(point(0), 0);
        // A point stamped long ago, appended "now", is evicted immediately
        history.append(point(1), 60_000);
        assert!(history.is_empty());
    }

    #[test]
    fn test_out_of_order_timestamp_is_clamped() {
        let mut history = RingHistory::new(10, Duration::from_secs(3600));
        history.append(point(1_000), 1_000);
        history.append(point(500), 1_000);

        let snapshot = history.snapshot();
        assert_eq!(snapshot[1].timestamp, 1_000);
        assert!(snapshot.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_default_bounds_hold_for_long_run() {
        let mut history = RingHistory::default();
        let start = 1_700_000_000_000i64;

        // Three hours at a 1s cadence
        for i in 0..(3 * 3600) {
            let now = start + i * 1_000;
            history.append(point(now), now);

            assert!(history.len() <= DEFAULT_HISTORY_CAPACITY);
            let cutoff = now - DEFAULT_HISTORY_WINDOW.as_millis() as i64;
            assert!(history.oldest().unwrap().timestamp >= cutoff);
        }
    }
}
