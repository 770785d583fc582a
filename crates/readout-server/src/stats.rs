//! Equipment statistics counters and debug histograms.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters surfaced by each readout equipment.
///
/// All counters are relaxed atomics: they are observability data, written
/// from the equipment worker and read from anywhere.
#[derive(Default)]
pub struct EquipmentStats {
    pushed_up: AtomicU64,
    fifo_up_empty: AtomicU64,
    fifo_ready_full: AtomicU64,
    fifo_occupancy_free: AtomicU64,
    fifo_occupancy_ready: AtomicU64,
    memory_low: AtomicU64,
    pages: AtomicU64,
    pages_empty: AtomicU64,
    pages_lost: AtomicU64,
    timeframes: AtomicU64,
    rdh_check_ok: AtomicU64,
    rdh_check_err: AtomicU64,
    rdh_stream_err: AtomicU64,
}

macro_rules! counter {
    ($get:ident, $inc:ident, $field:ident) => {
        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }

        pub(crate) fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl EquipmentStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(pushed_up, add_pushed_up, pushed_up);
    counter!(fifo_up_empty, inc_fifo_up_empty, fifo_up_empty);
    counter!(fifo_ready_full, inc_fifo_ready_full, fifo_ready_full);
    counter!(memory_low, inc_memory_low, memory_low);
    counter!(pages, inc_pages, pages);
    counter!(pages_empty, inc_pages_empty, pages_empty);
    counter!(pages_lost, inc_pages_lost, pages_lost);
    counter!(timeframes, inc_timeframes, timeframes);
    counter!(rdh_check_ok, inc_rdh_check_ok, rdh_check_ok);
    counter!(rdh_check_err, inc_rdh_check_err, rdh_check_err);
    counter!(rdh_stream_err, inc_rdh_stream_err, rdh_stream_err);

    /// Latest free-slot count of the card transfer queue.
    #[must_use]
    pub fn fifo_occupancy_free(&self) -> u64 {
        self.fifo_occupancy_free.load(Ordering::Relaxed)
    }

    pub(crate) fn set_fifo_occupancy_free(&self, v: u64) {
        self.fifo_occupancy_free.store(v, Ordering::Relaxed);
    }

    /// Latest size of the card ready queue.
    #[must_use]
    pub fn fifo_occupancy_ready(&self) -> u64 {
        self.fifo_occupancy_ready.load(Ordering::Relaxed)
    }

    pub(crate) fn set_fifo_occupancy_ready(&self, v: u64) {
        self.fifo_occupancy_ready.store(v, Ordering::Relaxed);
    }

    /// Zero everything; used by `init_counters` at run start.
    pub(crate) fn reset(&self) {
        self.pushed_up.store(0, Ordering::Relaxed);
        self.fifo_up_empty.store(0, Ordering::Relaxed);
        self.fifo_ready_full.store(0, Ordering::Relaxed);
        self.fifo_occupancy_free.store(0, Ordering::Relaxed);
        self.fifo_occupancy_ready.store(0, Ordering::Relaxed);
        self.memory_low.store(0, Ordering::Relaxed);
        self.pages.store(0, Ordering::Relaxed);
        self.pages_empty.store(0, Ordering::Relaxed);
        self.pages_lost.store(0, Ordering::Relaxed);
        self.timeframes.store(0, Ordering::Relaxed);
        self.rdh_check_ok.store(0, Ordering::Relaxed);
        self.rdh_check_err.store(0, Ordering::Relaxed);
        self.rdh_stream_err.store(0, Ordering::Relaxed);
    }
}

/// Fixed-bucket occupancy histogram for the card queues, armed by
/// `debugStatsEnabled` and dumped at stop.
pub struct OccupancyHistogram {
    label: &'static str,
    /// Upper bound of the sampled value (queue depth).
    range: u64,
    buckets: Vec<AtomicU64>,
}

impl OccupancyHistogram {
    #[must_use]
    pub fn new(label: &'static str, buckets: usize, range: u64) -> Self {
        Self {
            label,
            range: range.max(1),
            buckets: (0..buckets.max(1)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn record(&self, value: u64) {
        let n = self.buckets.len() as u64;
        let index = (value * n / (self.range + 1)).min(n - 1) as usize;
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Log the distribution, one line per bucket with its sample fraction.
    pub fn dump(&self) {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        info!(histogram = self.label, samples = total, "queue occupancy");
        for (i, count) in counts.iter().enumerate() {
            let lo = self.range as f64 * i as f64 / counts.len() as f64;
            let hi = self.range as f64 * (i + 1) as f64 / counts.len() as f64;
            let fraction = if total > 0 {
                *count as f64 * 100.0 / total as f64
            } else {
                0.0
            };
            info!(
                histogram = self.label,
                bucket = format!("{:.0}-{:.0}", lo, hi),
                count,
                fraction = format!("{fraction:.1}%"),
                "occupancy bucket"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_and_reset() {
        let s = EquipmentStats::new();
        s.add_pushed_up(3);
        s.inc_memory_low(1);
        s.set_fifo_occupancy_free(7);
        assert_eq!(s.pushed_up(), 3);
        assert_eq!(s.memory_low(), 1);
        assert_eq!(s.fifo_occupancy_free(), 7);
        s.reset();
        assert_eq!(s.pushed_up(), 0);
        assert_eq!(s.memory_low(), 0);
        assert_eq!(s.fifo_occupancy_free(), 0);
    }

    #[test]
    fn test_histogram_buckets_cover_range() {
        let h = OccupancyHistogram::new("test", 4, 8);
        for v in 0..=8 {
            h.record(v);
        }
        let total: u64 = h
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum();
        assert_eq!(total, 9);
        // extremes land in the first and last buckets
        assert!(h.buckets[0].load(Ordering::Relaxed) > 0);
        assert!(h.buckets[3].load(Ordering::Relaxed) > 0);
    }
}
