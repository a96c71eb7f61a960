//! Change timestamps and the per-origin watermarks used to skip stale events.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use time::OffsetDateTime;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Issues change timestamps that follow the wall clock but never repeat or go backwards.
#[derive(Debug, Default)]
pub struct ChangeClock {
    last: AtomicI64,
}

impl ChangeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, strictly greater than every timestamp issued before.
    pub fn next(&self) -> i64 {
        self.next_after(now_ms())
    }

    fn next_after(&self, wall: i64) -> i64 {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = wall.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Highest change timestamp applied per origin node.
#[derive(Debug, Default)]
pub struct OriginWatermarks {
    marks: DashMap<String, i64>,
}

impl OriginWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `timestamp_ms` is newer than anything applied from `origin`.
    pub fn is_fresh(&self, origin: &str, timestamp_ms: i64) -> bool {
        self.marks
            .get(origin)
            .is_none_or(|mark| timestamp_ms > *mark)
    }

    /// Raise the watermark of `origin`; lower values are ignored.
    pub fn advance(&self, origin: &str, timestamp_ms: i64) {
        self.marks
            .entry(origin.to_owned())
            .and_modify(|mark| *mark = (*mark).max(timestamp_ms))
            .or_insert(timestamp_ms);
    }

    pub fn get(&self, origin: &str) -> Option<i64> {
        self.marks.get(origin).map(|mark| *mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_never_repeats_when_wall_clock_stalls() {
        let clock = ChangeClock::new();
        let first = clock.next_after(1_000);
        let second = clock.next_after(1_000);
        let third = clock.next_after(900);
        assert_eq!((first, second, third), (1_000, 1_001, 1_002));
        assert_eq!(clock.next_after(5_000), 5_000);
    }

    #[test]
    fn watermarks_are_tracked_per_origin() {
        let marks = OriginWatermarks::new();
        assert!(marks.is_fresh("node-a", 10));

        marks.advance("node-a", 10);
        marks.advance("node-a", 5);
        assert_eq!(marks.get("node-a"), Some(10));
        assert!(!marks.is_fresh("node-a", 10));
        assert!(marks.is_fresh("node-a", 11));
        assert!(marks.is_fresh("node-b", 1));
    }
}
