//! Streaming aggregate statistics
//!
//! Seeded once from the persisted store when a backend is attached, then
//! updated per persisted event. Throughput is tracked with two one-second
//! buckets (current and preceding), so memory stays constant no matter how
//! long the recorder runs.

use crate::models::{ActivityEvent, DbStats};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy)]
struct SecondBucket {
    second: i64,
    hits: u64,
}

#[derive(Debug, Default)]
struct StatsState {
    biggest_request_size: u64,
    total_requests_size: u64,
    total_record_count: u64,
    max_hits_by_second: u64,
    current: Option<SecondBucket>,
    previous: Option<SecondBucket>,
}

impl StatsState {
    /// Count one hit for `second` and return the bucket's new total.
    fn record_hit(&mut self, second: i64) -> u64 {
        let Some(current) = self.current else {
            self.current = Some(SecondBucket { second, hits: 1 });
            return 1;
        };

        if second == current.second {
            let hits = current.hits + 1;
            self.current = Some(SecondBucket { second, hits });
            hits
        } else if second > current.second {
            self.previous = Some(current);
            self.current = Some(SecondBucket { second, hits: 1 });
            1
        } else {
            match self.previous.as_mut() {
                Some(previous) if previous.second == second => {
                    previous.hits += 1;
                    previous.hits
                }
                // Older than both retained buckets; its count is no longer tracked.
                _ => 1,
            }
        }
    }
}

#[derive(Default)]
pub struct StatsEngine {
    state: Mutex<StatsState>,
}

impl StatsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from statistics computed over the persisted store.
    pub fn seeded(stats: DbStats) -> Self {
        let engine = Self::new();
        engine.seed(stats);
        engine
    }

    fn state(&self) -> MutexGuard<'_, StatsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace all aggregates with `stats`, e.g. after the store was relocated.
    pub fn seed(&self, stats: DbStats) {
        *self.state() = StatsState {
            biggest_request_size: stats.biggest_request_size,
            total_requests_size: stats.total_requests_size,
            total_record_count: stats.total_record_count,
            max_hits_by_second: stats.max_hits_by_second,
            current: None,
            previous: None,
        };
    }

    /// Account for one persisted event.
    pub fn update(&self, event: &ActivityEvent) {
        self.record(event.request_size(), event.capture_second());
    }

    /// Same as [`update`](Self::update) for an event that has already been
    /// handed to the backend.
    pub fn record(&self, request_size: u64, capture_second: i64) {
        let mut state = self.state();
        state.total_record_count += 1;
        state.total_requests_size = state.total_requests_size.saturating_add(request_size);
        state.biggest_request_size = state.biggest_request_size.max(request_size);
        let hits = state.record_hit(capture_second);
        state.max_hits_by_second = state.max_hits_by_second.max(hits);
    }

    /// Consistent point-in-time copy of the aggregates. `size_on_disk` is left
    /// for the caller to fill from the backend.
    pub fn snapshot(&self) -> DbStats {
        let state = self.state();
        DbStats {
            size_on_disk: None,
            biggest_request_size: state.biggest_request_size,
            total_requests_size: state.total_requests_size,
            total_record_count: state.total_record_count,
            max_hits_by_second: state.max_hits_by_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_event;
    use std::sync::Arc;

    fn event_at(second: i64, offset_ms: i64) -> ActivityEvent {
        let mut event = sample_event("tx", "/");
        event.captured_at_ms = second * 1000 + offset_ms;
        event
    }

    #[test]
    fn counts_records_and_bytes() {
        let engine = StatsEngine::new();
        let mut big = event_at(10, 0);
        big.request_body_size = 10_000;
        engine.update(&event_at(10, 1));
        engine.update(&big);
        engine.update(&event_at(11, 0));

        let stats = engine.snapshot();
        assert_eq!(stats.total_record_count, 3);
        assert_eq!(stats.total_requests_size, 130 + 10_120 + 130);
        assert_eq!(stats.biggest_request_size, 10_120);
        assert_eq!(stats.size_on_disk, None);
    }

    #[test]
    fn burst_in_one_second_sets_peak() {
        let engine = StatsEngine::new();
        for i in 0..50 {
            engine.update(&event_at(1_700_000_000, i * 10));
        }
        engine.update(&event_at(1_700_000_001, 0));

        let stats = engine.snapshot();
        assert_eq!(stats.max_hits_by_second, 50);
        assert_eq!(stats.total_record_count, 51);
    }

    #[test]
    fn late_event_counts_toward_preceding_second() {
        let engine = StatsEngine::new();
        engine.update(&event_at(100, 0));
        engine.update(&event_at(101, 0));
        engine.update(&event_at(100, 900));
        engine.update(&event_at(100, 950));
        assert_eq!(engine.snapshot().max_hits_by_second, 3);
    }

    #[test]
    fn much_older_event_does_not_inflate_peak() {
        let engine = StatsEngine::new();
        engine.update(&event_at(200, 0));
        engine.update(&event_at(200, 1));
        engine.update(&event_at(205, 0));
        engine.update(&event_at(150, 0));
        let stats = engine.snapshot();
        assert_eq!(stats.max_hits_by_second, 2);
        assert_eq!(stats.total_record_count, 4);
    }

    #[test]
    fn seed_continues_from_persisted_values() {
        let engine = StatsEngine::seeded(DbStats {
            size_on_disk: Some(4096),
            biggest_request_size: 500,
            total_requests_size: 1000,
            total_record_count: 4,
            max_hits_by_second: 9,
        });
        engine.update(&event_at(1, 0));

        let stats = engine.snapshot();
        assert_eq!(stats.total_record_count, 5);
        assert_eq!(stats.total_requests_size, 1130);
        assert_eq!(stats.biggest_request_size, 500);
        assert_eq!(stats.max_hits_by_second, 9);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let engine = Arc::new(StatsEngine::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        engine.update(&event_at(i / 100, 0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(engine.snapshot().total_record_count, 2000);
    }
}
