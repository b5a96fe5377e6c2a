// =============================================================================
// SeriesBuffer — bounded, deduplicated, time-ordered point store
// =============================================================================
//
// Pure data structure, no I/O. One buffer per realtime session; points arrive
// from either the stream listener or a poll tick and are linearized by the
// write lock inside `append`, so the dedup/order/bound invariants hold after
// every mutation regardless of which task appended.
// =============================================================================

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default number of points retained per series.
pub const DEFAULT_MAX_POINTS: usize = 50;

/// A single chart point. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Seconds since the UNIX epoch (midnight UTC for historical dates).
    pub time: i64,
    pub value: f64,
}

impl Point {
    pub fn new(time: i64, value: f64) -> Self {
        Self { time, value }
    }
}

/// Bounded series keyed by `time`.
///
/// Invariants, re-established synchronously inside every `append`:
///   - no two entries share `time` (last write wins),
///   - length never exceeds `max_points` (oldest dropped first),
///   - snapshots are sorted ascending by `time`.
pub struct SeriesBuffer {
    points: RwLock<BTreeMap<i64, f64>>,
    max_points: usize,
}

impl SeriesBuffer {
    pub fn new(max_points: usize) -> Self {
        Self {
            points: RwLock::new(BTreeMap::new()),
            max_points: max_points.max(1),
        }
    }

    /// Insert or overwrite the entry with matching `time`, truncate to the most
    /// recent `max_points` entries, and return the resulting ordered snapshot.
    ///
    /// Non-finite values are coerced to `0.0` before storage (the same
    /// defensive normalization the fetch paths apply).
    pub fn append(&self, point: Point) -> Vec<Point> {
        let value = if point.value.is_finite() { point.value } else { 0.0 };

        let mut map = self.points.write();
        map.insert(point.time, value);
        while map.len() > self.max_points {
            map.pop_first();
        }
        map.iter().map(|(&time, &value)| Point { time, value }).collect()
    }

    /// Current ordered snapshot (ascending by `time`).
    pub fn snapshot(&self) -> Vec<Point> {
        self.points
            .read()
            .iter()
            .map(|(&time, &value)| Point { time, value })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_dedups_and_sorts() {
        let buf = SeriesBuffer::new(10);
        buf.append(Point::new(1, 10.0));
        buf.append(Point::new(3, 30.0));
        buf.append(Point::new(2, 20.0));
        let snap = buf.append(Point::new(1, 15.0));

        assert_eq!(
            snap,
            vec![Point::new(1, 15.0), Point::new(2, 20.0), Point::new(3, 30.0)]
        );
    }

    #[test]
    fn trims_oldest_beyond_max_points() {
        let buf = SeriesBuffer::new(3);
        for t in 0..5 {
            buf.append(Point::new(t, t as f64));
        }

        let snap = buf.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].time, 2);
        assert_eq!(snap[2].time, 4);
    }

    #[test]
    fn duplicate_time_does_not_grow_length() {
        let buf = SeriesBuffer::new(2);
        buf.append(Point::new(5, 1.0));
        buf.append(Point::new(5, 2.0));
        buf.append(Point::new(5, 3.0));

        assert_eq!(buf.len(), 1);
        assert_eq!(buf.snapshot(), vec![Point::new(5, 3.0)]);
    }

    #[test]
    fn non_finite_values_coerced_to_zero() {
        let buf = SeriesBuffer::new(10);
        buf.append(Point::new(1, f64::NAN));
        buf.append(Point::new(2, f64::INFINITY));
        buf.append(Point::new(3, f64::NEG_INFINITY));

        let snap = buf.snapshot();
        assert!(snap.iter().all(|p| p.value == 0.0));
    }

    #[test]
    fn snapshot_is_strictly_ascending() {
        let buf = SeriesBuffer::new(50);
        for t in [9_i64, 4, 7, 1, 9, 3, 4] {
            buf.append(Point::new(t, t as f64));
        }

        let snap = buf.snapshot();
        assert!(snap.windows(2).all(|w| w[0].time < w[1].time));
        assert_eq!(snap.len(), 5);
    }

    #[test]
    fn empty_buffer_snapshot() {
        let buf = SeriesBuffer::new(5);
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }
}
