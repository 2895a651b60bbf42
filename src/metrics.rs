//! [`PoolMetricsTracker`] — acquisition/usage/creation timing, counters, and
//! gauges, in a no-op and an in-memory flavor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

const WINDOW_SIZE: usize = 100;

/// A bounded sliding window of up to [`WINDOW_SIZE`] duration samples.
#[derive(Default)]
struct Window {
    samples: Vec<Duration>,
    next: usize,
}

impl Window {
    fn record(&mut self, sample: Duration) {
        if self.samples.len() < WINDOW_SIZE {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
            self.next = (self.next + 1) % WINDOW_SIZE;
        }
    }

    fn mean(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }
}

/// A point-in-time snapshot of pool metrics.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub avg_acquisition_time: Duration,
    pub avg_usage_time: Duration,
    pub avg_creation_time: Duration,
    pub timeouts: u64,
    pub leaks: u64,
    pub total_acquisitions: u64,
    pub total_releases: u64,
    pub total_creations: u64,
    pub total_removals: u64,
    pub gauges: HashMap<String, i64>,
}

/// Records acquisition/usage/creation durations, timeouts, leaks, and
/// gauges. All updates are atomic; reads are consistent per field, not
/// globally (a snapshot may observe fields captured at slightly different
/// instants under concurrent writers).
pub trait PoolMetricsTracker: Send + Sync {
    fn record_acquisition(&self, _duration: Duration) {}
    fn record_usage(&self, _duration: Duration) {}
    fn record_creation(&self, _duration: Duration) {}
    fn record_timeout(&self) {}
    fn record_leak(&self) {}
    fn record_acquisition_started(&self) {}
    fn record_release(&self) {}
    fn record_removal(&self) {}
    fn set_gauge(&self, _name: &str, _value: i64) {}
    fn snapshot(&self) -> PoolMetrics {
        PoolMetrics::default()
    }
}

/// A tracker that discards everything; used when metrics are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl PoolMetricsTracker for NoopTracker {}

/// The in-memory tracker used when metrics are enabled.
#[derive(Default)]
pub struct InMemoryTracker {
    acquisition: Mutex<Window>,
    usage: Mutex<Window>,
    creation: Mutex<Window>,
    timeouts: AtomicU64,
    leaks: AtomicU64,
    total_acquisitions: AtomicU64,
    total_releases: AtomicU64,
    total_creations: AtomicU64,
    total_removals: AtomicU64,
    gauges: Mutex<HashMap<String, AtomicI64>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoolMetricsTracker for InMemoryTracker {
    fn record_acquisition(&self, duration: Duration) {
        self.acquisition.lock().record(duration);
        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_usage(&self, duration: Duration) {
        self.usage.lock().record(duration);
    }

    fn record_creation(&self, duration: Duration) {
        self.creation.lock().record(duration);
        self.total_creations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_leak(&self) {
        self.leaks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition_started(&self) {
        // Acquisition-time samples are recorded in `record_acquisition`;
        // this hook exists for callers that want to mark attempts
        // separately (none currently do), kept for symmetry with the
        // release counter.
    }

    fn record_release(&self) {
        self.total_releases.fetch_add(1, Ordering::Relaxed);
    }

    fn record_removal(&self) {
        self.total_removals.fetch_add(1, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &str, value: i64) {
        let gauges = self.gauges.lock();
        if let Some(existing) = gauges.get(name) {
            existing.store(value, Ordering::Relaxed);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.lock();
        gauges
            .entry(name.to_owned())
            .or_insert_with(|| AtomicI64::new(value))
            .store(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolMetrics {
        PoolMetrics {
            avg_acquisition_time: self.acquisition.lock().mean(),
            avg_usage_time: self.usage.lock().mean(),
            avg_creation_time: self.creation.lock().mean(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            leaks: self.leaks.load(Ordering::Relaxed),
            total_acquisitions: self.total_acquisitions.load(Ordering::Relaxed),
            total_releases: self.total_releases.load(Ordering::Relaxed),
            total_creations: self.total_creations.load(Ordering::Relaxed),
            total_removals: self.total_removals.load(Ordering::Relaxed),
            gauges: self
                .gauges
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reports_the_mean_of_up_to_100_samples() {
        let mut window = Window::default();
        for ms in 1..=150u64 {
            window.record(Duration::from_millis(ms));
        }
        // Only the last 100 samples (51..=150) survive.
        let expected_mean: u64 = (51..=150).sum::<u64>() / 100;
        assert_eq!(window.mean().as_millis() as u64, expected_mean);
    }

    #[test]
    fn noop_tracker_snapshot_is_always_default() {
        let tracker = NoopTracker;
        tracker.record_acquisition(Duration::from_secs(1));
        tracker.record_timeout();
        assert_eq!(tracker.snapshot().total_acquisitions, 0);
    }

    #[test]
    fn in_memory_tracker_accumulates_counters_and_gauges() {
        let tracker = InMemoryTracker::new();
        tracker.record_acquisition(Duration::from_millis(10));
        tracker.record_acquisition(Duration::from_millis(20));
        tracker.record_timeout();
        tracker.record_leak();
        tracker.set_gauge("idle", 3);
        tracker.set_gauge("idle", 5);

        let snap = tracker.snapshot();
        assert_eq!(snap.total_acquisitions, 2);
        assert_eq!(snap.avg_acquisition_time, Duration::from_millis(15));
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.leaks, 1);
        assert_eq!(snap.gauges.get("idle"), Some(&5));
    }
}
