//! Performance counters
//!
//! Counters are enabled with `show_perf`. A disabled counter runs the
//! measured closure and records nothing.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Default)]
struct Totals {
    count: u64,
    total: Duration,
}

/// Summary of a counter since its last report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfReport {
    /// Number of measurements
    pub count: u64,
    /// Sum of all measurements
    pub total: Duration,
    /// Mean measurement
    pub average: Duration,
}

/// Accumulating timer
#[derive(Debug)]
pub struct PerfCounter {
    name: &'static str,
    totals: Option<Mutex<Totals>>,
}

impl PerfCounter {
    /// Create a counter, recording only when `enabled`
    pub fn new(name: &'static str, enabled: bool) -> Self {
        Self {
            name,
            totals: enabled.then(|| Mutex::new(Totals::default())),
        }
    }

    /// Counter name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the counter records measurements
    pub fn is_enabled(&self) -> bool {
        self.totals.is_some()
    }

    /// Run `f`, recording how long it took
    pub fn measure<T>(&self, f: impl FnOnce() -> T) -> T {
        let Some(totals) = &self.totals else {
            return f();
        };
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        let mut totals = totals.lock();
        totals.count += 1;
        totals.total += elapsed;
        result
    }

    /// Log and return the totals since the last report, then reset them
    pub fn report(&self) -> Option<PerfReport> {
        let totals = self.totals.as_ref()?;
        let Totals { count, total } = std::mem::take(&mut *totals.lock());
        let average = average(total, count);
        info!(
            counter = self.name,
            count,
            total_ms = total.as_secs_f64() * 1000.0,
            average_us = average.as_secs_f64() * 1_000_000.0,
            "perf"
        );
        Some(PerfReport {
            count,
            total,
            average,
        })
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
