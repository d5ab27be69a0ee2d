use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
struct TimerStats {
    total: Duration,
    samples: u64,
}

/// Counter and timer accumulator fed by the ledger.
///
/// Counters track lifecycle events (signals, opens, closes by reason,
/// progressions); timers track how long recurring passes take. Reads are
/// pure; nothing here has side effects beyond its own maps.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    counters: HashMap<&'static str, u64>,
    timers: HashMap<&'static str, TimerStats>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &'static str, amount: u64) {
        *self.counters.entry(name).or_insert(0) += amount;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn record_duration(&mut self, name: &'static str, elapsed: Duration) {
        let stats = self.timers.entry(name).or_default();
        stats.total += elapsed;
        stats.samples += 1;
    }

    /// Time a closure and record it under `name`
    pub fn time<R>(&mut self, name: &'static str, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        self.record_duration(name, started.elapsed());
        result
    }

    pub fn timer_samples(&self, name: &str) -> u64 {
        self.timers.get(name).map(|s| s.samples).unwrap_or(0)
    }

    pub fn timer_average(&self, name: &str) -> Option<Duration> {
        let stats = self.timers.get(name)?;
        if stats.samples == 0 {
            return None;
        }
        Some(stats.total / stats.samples as u32)
    }

    /// Counters sorted by name, for logging and telemetry
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut entries: Vec<_> = self.counters.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by_key(|(k, _)| *k);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut monitor = PerformanceMonitor::new();
        monitor.incr("positions_opened");
        monitor.incr("positions_opened");
        monitor.add("signals_processed", 5);

        assert_eq!(monitor.counter("positions_opened"), 2);
        assert_eq!(monitor.counter("signals_processed"), 5);
        assert_eq!(monitor.counter("never_touched"), 0);
    }

    #[test]
    fn test_timers_average() {
        let mut monitor = PerformanceMonitor::new();
        monitor.record_duration("manage_pass", Duration::from_millis(10));
        monitor.record_duration("manage_pass", Duration::from_millis(30));

        assert_eq!(monitor.timer_samples("manage_pass"), 2);
        assert_eq!(
            monitor.timer_average("manage_pass"),
            Some(Duration::from_millis(20))
        );
        assert_eq!(monitor.timer_average("missing"), None);
    }

    #[test]
    fn test_time_closure_records_and_returns() {
        let mut monitor = PerformanceMonitor::new();
        let value = monitor.time("work", || 7);
        assert_eq!(value, 7);
        assert_eq!(monitor.timer_samples("work"), 1);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut monitor = PerformanceMonitor::new();
        monitor.incr("zebra");
        monitor.incr("alpha");

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot, vec![("alpha", 1), ("zebra", 1)]);
    }
}
